use serde::Serialize;
use crate::error::{BackupError, Result};
use crate::index::{BinlogStatus, IndexContent};
use crate::service::mysql::mysql_service::quote_str;

/// Coordinates to attach a restored instance under `master_host:master_port`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ChangeMaster {
    pub master_host: String,
    pub master_port: u16,
    pub binlog_file: String,
    pub binlog_pos: String,
    pub gtid: String,
}

impl ChangeMaster {
    fn from_status(status: &BinlogStatus, host: &str, port: u16) -> ChangeMaster {
        ChangeMaster {
            master_host: host.to_string(),
            master_port: port,
            binlog_file: status.binlog_file.clone(),
            binlog_pos: status.binlog_pos.clone(),
            gtid: status.gtid.clone(),
        }
    }
}

/// The backup either came from the requested master itself, or from a replica
/// of it whose upstream position was recorded.
pub fn find_binlog_pos(index: &IndexContent, master_host: &str, master_port: u16) -> Result<ChangeMaster> {
    let own = &index.binlog_info.show_master_status;
    if own.master_host == master_host && own.master_port == master_port && !own.binlog_file.is_empty() {
        return Ok(ChangeMaster::from_status(own, master_host, master_port));
    }
    if index.mysql_role.is_replica() {
        if let Some(upstream) = &index.binlog_info.show_slave_status {
            if upstream.master_host == master_host && upstream.master_port == master_port && !upstream.binlog_file.is_empty() {
                return Ok(ChangeMaster::from_status(upstream, master_host, master_port));
            }
        }
    }
    Err(BackupError::integrity(format!(
        "cannot find binlog pos for current master {}:{}",
        master_host, master_port
    )))
}

pub fn change_master_sql(pos: &ChangeMaster, user: &str, password: &str) -> Result<String> {
    let log_pos: u64 = pos
        .binlog_pos
        .trim()
        .parse()
        .map_err(|_| BackupError::integrity(format!("binlog pos '{}' is not a number", pos.binlog_pos)))?;
    Ok(format!(
        "CHANGE MASTER TO MASTER_HOST={}, MASTER_PORT={}, MASTER_USER={}, MASTER_PASSWORD={}, \
         MASTER_LOG_FILE={}, MASTER_LOG_POS={}",
        quote_str(&pos.master_host),
        pos.master_port,
        quote_str(user),
        quote_str(password),
        quote_str(&pos.binlog_file),
        log_pos
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupType, DataSchemaGrant, MysqlRole};

    fn slave_index() -> IndexContent {
        let mut index = IndexContent::new(
            "id".to_string(),
            "10.0.0.9".to_string(),
            3306,
            MysqlRole::Slave,
            BackupType::Physical,
            DataSchemaGrant::ALL,
        );
        index.binlog_info.show_master_status = BinlogStatus {
            binlog_file: "binlog20000.000012".to_string(),
            binlog_pos: "4528".to_string(),
            master_host: "10.0.0.9".to_string(),
            master_port: 3306,
            ..Default::default()
        };
        index.binlog_info.show_slave_status = Some(BinlogStatus {
            binlog_file: "binlog20000.000377".to_string(),
            binlog_pos: "120".to_string(),
            master_host: "10.0.0.1".to_string(),
            master_port: 3306,
            ..Default::default()
        });
        index
    }

    #[test]
    fn test_backup_taken_on_master() {
        let pos = find_binlog_pos(&slave_index(), "10.0.0.9", 3306).unwrap();
        assert_eq!(pos.binlog_file, "binlog20000.000012");
        assert_eq!(pos.binlog_pos, "4528");
    }

    #[test]
    fn test_backup_taken_on_replica() {
        let pos = find_binlog_pos(&slave_index(), "10.0.0.1", 3306).unwrap();
        assert_eq!(pos.binlog_file, "binlog20000.000377");
        assert_eq!(pos.master_host, "10.0.0.1");
        let sql = change_master_sql(&pos, "repl", "pw").unwrap();
        assert_eq!(
            sql,
            "CHANGE MASTER TO MASTER_HOST='10.0.0.1', MASTER_PORT=3306, MASTER_USER='repl', \
             MASTER_PASSWORD='pw', MASTER_LOG_FILE='binlog20000.000377', MASTER_LOG_POS=120"
        );
    }

    #[test]
    fn test_upstream_changed_since_backup() {
        let err = find_binlog_pos(&slave_index(), "10.0.0.2", 3306).unwrap_err();
        assert!(err
            .to_string()
            .contains("cannot find binlog pos for current master 10.0.0.2:3306"));
    }
}
