use std::path::PathBuf;
use std::time::Duration;
use log::{debug, info};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::{Executor, MySqlPool, Row};
use crate::config::{is_system_db, PublicConfig};
use crate::error::{BackupError, Result};
use crate::version::MysqlVersion;

/// What `SHOW SLAVE STATUS` tells about the upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveStatus {
    pub master_host: String,
    pub master_port: u16,
    pub relay_master_log_file: String,
    pub exec_master_log_pos: String,
    pub executed_gtid_set: String,
    pub io_running: bool,
    pub sql_running: bool,
}

/// A connected MySQL instance: every server query the engine needs lives here.
#[derive(Clone)]
pub struct MySQLService {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pool: MySqlPool,
}

/// Reads a column as text whether the server sent it as a string, a blob or a number.
pub fn row_string(row: &MySqlRow, index: usize) -> String {
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(index) {
        return v;
    }
    if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return String::from_utf8_lossy(&v).to_string();
    }
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(index) {
        return v.to_string();
    }
    if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(index) {
        return v.to_string();
    }
    String::new()
}

pub fn row_string_by_name(row: &MySqlRow, name: &str) -> Option<String> {
    use sqlx::Column;
    row.columns()
        .iter()
        .position(|c| c.name().eq_ignore_ascii_case(name))
        .map(|i| row_string(row, i))
}

/// Quote an identifier for SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a string literal for SQL text.
pub fn quote_str(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl MySQLService {
    pub async fn connect(public: &PublicConfig) -> Result<MySQLService> {
        let mut options = MySqlConnectOptions::new()
            .host(&public.host)
            .port(public.port)
            .username(&public.user)
            .password(&public.password);
        if let Some(socket) = &public.socket {
            options = options.socket(socket);
        }
        Self::connect_with(&public.host, public.port, &public.user, options).await
    }

    pub async fn connect_with(host: &str, port: u16, user: &str, options: MySqlConnectOptions) -> Result<MySQLService> {
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| BackupError::precheck(format!("connect {}:{}: {}", host, port, e)))?;
        debug!("connected to {}:{}", host, port);
        Ok(MySQLService {
            host: host.to_string(),
            port,
            user: user.to_string(),
            pool,
        })
    }

    /// Runs over the text protocol, so statements that cannot be prepared work too.
    pub async fn exec(&self, sql: &str) -> Result<u64> {
        debug!("exec sql: {}", sql);
        let done = self.pool.execute(sql).await?;
        Ok(done.rows_affected())
    }

    pub async fn query_rows(&self, sql: &str) -> Result<Vec<MySqlRow>> {
        Ok(self.pool.fetch_all(sql).await?)
    }

    pub async fn query_string(&self, sql: &str) -> Result<Option<String>> {
        let row = self.pool.fetch_optional(sql).await?;
        Ok(row.map(|r| row_string(&r, 0)))
    }

    pub async fn global_variable(&self, name: &str) -> Result<Option<String>> {
        let rows = self
            .query_rows(&format!("SHOW GLOBAL VARIABLES LIKE {}", quote_str(name)))
            .await?;
        Ok(rows.first().map(|r| row_string(r, 1)))
    }

    pub async fn version(&self) -> Result<MysqlVersion> {
        let raw = self
            .query_string("SELECT VERSION()")
            .await?
            .ok_or_else(|| BackupError::precheck("empty version"))?;
        MysqlVersion::parse(&raw)
    }

    /// The engine used by user tables; RocksDB or TokuDB take precedence over InnoDB.
    pub async fn storage_engine(&self) -> Result<String> {
        let rows = self
            .query_rows(
                "SELECT DISTINCT UPPER(ENGINE) FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA NOT IN ('mysql','sys','information_schema','performance_schema') \
                 AND ENGINE IS NOT NULL",
            )
            .await?;
        let engines: Vec<String> = rows.iter().map(|r| row_string(r, 0)).collect();
        for special in ["ROCKSDB", "TOKUDB"] {
            if engines.iter().any(|e| e == special) {
                return Ok(special.to_string());
            }
        }
        let default = self
            .query_string("SELECT UPPER(@@default_storage_engine)")
            .await?
            .unwrap_or_else(|| "INNODB".to_string());
        Ok(default)
    }

    pub async fn log_bin_enabled(&self) -> Result<bool> {
        let value = self.global_variable("log_bin").await?.unwrap_or_default();
        Ok(value.eq_ignore_ascii_case("ON") || value == "1")
    }

    pub async fn init_connect(&self) -> Result<String> {
        Ok(self.global_variable("init_connect").await?.unwrap_or_default())
    }

    pub async fn set_init_connect(&self, value: &str) -> Result<()> {
        self.exec(&format!("SET GLOBAL init_connect = {}", quote_str(value))).await?;
        Ok(())
    }

    /// Directories whose size decides auto backup type: datadir plus tokudb_data_dir.
    pub async fn data_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        if let Some(datadir) = self.global_variable("datadir").await? {
            dirs.push(PathBuf::from(datadir));
        }
        if let Some(toku) = self.global_variable("tokudb_data_dir").await? {
            if !toku.is_empty() && !dirs.iter().any(|d| d == &PathBuf::from(&toku)) {
                dirs.push(PathBuf::from(toku));
            }
        }
        Ok(dirs)
    }

    /// Default charsets of the server and of every user schema.
    pub async fn server_charsets(&self) -> Result<Vec<String>> {
        let mut charsets: Vec<String> = Vec::new();
        if let Some(server) = self.global_variable("character_set_server").await? {
            charsets.push(server.to_ascii_lowercase());
        }
        let rows = self
            .query_rows("SELECT SCHEMA_NAME, DEFAULT_CHARACTER_SET_NAME FROM information_schema.SCHEMATA")
            .await?;
        for row in rows {
            if is_system_db(&row_string(&row, 0)) {
                continue;
            }
            let charset = row_string(&row, 1).to_ascii_lowercase();
            if !charsets.contains(&charset) {
                charsets.push(charset);
            }
        }
        Ok(charsets)
    }

    pub async fn slave_status(&self) -> Result<Option<SlaveStatus>> {
        let rows = self.query_rows("SHOW SLAVE STATUS").await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let get = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| row_string_by_name(row, n))
                .unwrap_or_default()
        };
        let status = SlaveStatus {
            master_host: get(&["Master_Host", "Source_Host"]),
            master_port: get(&["Master_Port", "Source_Port"]).parse().unwrap_or(0),
            relay_master_log_file: get(&["Relay_Master_Log_File", "Relay_Source_Log_File"]),
            exec_master_log_pos: get(&["Exec_Master_Log_Pos", "Exec_Source_Log_Pos"]),
            executed_gtid_set: get(&["Executed_Gtid_Set"]),
            io_running: get(&["Slave_IO_Running", "Replica_IO_Running"]).eq_ignore_ascii_case("Yes"),
            sql_running: get(&["Slave_SQL_Running", "Replica_SQL_Running"]).eq_ignore_ascii_case("Yes"),
        };
        Ok(Some(status))
    }

    pub async fn start_slave(&self) -> Result<()> {
        info!("start slave on {}:{}", self.host, self.port);
        self.exec("START SLAVE").await?;
        Ok(())
    }

    /// sql_mode, binlog_format, binlog_row_image, time_zone for the index.
    pub async fn session_facts(&self) -> Result<(String, String, String, String)> {
        let sql_mode = self.global_variable("sql_mode").await?.unwrap_or_default();
        let binlog_format = self.global_variable("binlog_format").await?.unwrap_or_default();
        let binlog_row_image = self.global_variable("binlog_row_image").await?.unwrap_or_default();
        let time_zone = self.global_variable("time_zone").await?.unwrap_or_default();
        Ok((sql_mode, binlog_format, binlog_row_image, time_zone))
    }

    pub async fn databases(&self) -> Result<Vec<String>> {
        let rows = self.query_rows("SHOW DATABASES").await?;
        Ok(rows.iter().map(|r| row_string(r, 0)).collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote_ident("my`db"), "`my``db`");
        assert_eq!(quote_str("it's"), "'it\\'s'");
        assert_eq!(quote_str("a\\b"), "'a\\\\b'");
    }
}
