use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::{debug, info, warn};
use sqlx::Row;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use crate::config::BackupConfig;
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::filter::DUMP_EXCLUDE_DBS;
use crate::index::{BinlogStatus, IndexContent};
use crate::runner::MyExec;
use crate::service::mysql::metadata::parse_xtrabackup_slave_info;
use crate::service::mysql::mysql_defaults::write_client_defaults;
use crate::service::mysql::mysql_service::{row_string, MySQLService};
use crate::service::service::{merge_slave_status, set_master_status, DumpTarget, Dumper, PackStrategy};
use crate::utils::{find_tool, now_string, split_extra_opt, weekday_log_file};
use crate::version::MysqlVersion;

/// Lines of the dump header searched for the `CHANGE MASTER TO` comment.
const HEADER_LINES: usize = 64;

pub fn create_command(bin: &Path, defaults_path: &Path, file_path: &Path) -> MyExec {
    // --defaults-file must come first or mysqldump ignores it.
    MyExec::new("mysqldump", bin)
        .arg(format!("--defaults-file={}", defaults_path.display()))
        .arg("--quick")
        .arg("--single-transaction")
        .arg(format!("--result-file={}", file_path.display()))
}

/// Options after the common ones: binlog position, content switches and targets.
pub fn dump_args(
    cnf: &BackupConfig,
    log_bin_disabled: bool,
    databases: &[String],
    ignore_tables: &[String],
) -> Vec<String> {
    let public = &cnf.public;
    let dsg = &public.data_schema_grant;
    let mut args = vec![
        format!("--default-character-set={}", public.charset),
        "--hex-blob".to_string(),
        "--max-allowed-packet=1G".to_string(),
        "--skip-opt".to_string(),
        "--create-options".to_string(),
        "--extended-insert".to_string(),
        "--add-drop-table".to_string(),
        "--set-charset".to_string(),
    ];
    if public.role.is_replica() {
        args.push("--dump-slave=2".to_string());
    } else if !log_bin_disabled {
        args.push("--master-data=2".to_string());
    }
    if dsg.schema {
        args.push("--routines".to_string());
        args.push("--triggers".to_string());
        args.push("--events".to_string());
    } else {
        args.push("--no-create-info".to_string());
        args.push("--skip-triggers".to_string());
    }
    if !dsg.data {
        args.push("--no-data".to_string());
    }
    for table in ignore_tables {
        args.push(format!("--ignore-table={}", table));
    }
    args.extend(split_extra_opt(&cnf.logical_backup_mysqldump.extra_opt));
    args.push("--databases".to_string());
    args.extend(databases.iter().cloned());
    args
}

pub struct MysqldumpDumper {
    cnf: BackupConfig,
    db: MySQLService,
    target: DumpTarget,
    bin: PathBuf,
    log_file: PathBuf,
    log_bin_disabled: bool,
    defaults: Option<NamedTempFile>,
    own_status: Option<BinlogStatus>,
    begin_time: String,
    end_time: String,
}

impl MysqldumpDumper {
    pub fn new(cnf: &BackupConfig, db: MySQLService, target: DumpTarget) -> MysqldumpDumper {
        MysqldumpDumper {
            cnf: cnf.clone(),
            db,
            target,
            bin: PathBuf::new(),
            log_file: PathBuf::new(),
            log_bin_disabled: false,
            defaults: None,
            own_status: None,
            begin_time: String::new(),
            end_time: String::new(),
        }
    }

    pub fn result_file(&self) -> PathBuf {
        self.target.dir().join(format!("{}.sql", self.target.target_name))
    }

    /// Explicit databases from the filter, otherwise every non-system schema.
    async fn resolve_targets(&self) -> Result<(Vec<String>, Vec<String>)> {
        let (databases, ignore) = self.cnf.logical_backup.filter.mysqldump_targets()?;
        if !databases.is_empty() {
            return Ok((databases, ignore));
        }
        let databases = self
            .db
            .databases()
            .await?
            .into_iter()
            .filter(|db| !DUMP_EXCLUDE_DBS.contains(&db.as_str()))
            .collect::<Vec<String>>();
        Ok((databases, ignore))
    }

    /// Replicas dump with `--dump-slave`, so their own position is read up front.
    async fn read_own_status(&self) -> Result<Option<BinlogStatus>> {
        if self.log_bin_disabled {
            return Ok(None);
        }
        let rows = self.db.query_rows("SHOW MASTER STATUS").await?;
        Ok(rows.first().map(|row| BinlogStatus {
            binlog_file: row_string(row, 0),
            binlog_pos: row_string(row, 1),
            gtid: if row.len() > 4 { row_string(row, 4) } else { String::new() },
            ..Default::default()
        }))
    }

    async fn read_header(&self) -> Result<String> {
        let file = tokio::fs::File::open(self.result_file()).await?;
        let mut lines = BufReader::new(file).lines();
        let mut header = String::new();
        let mut count = 0;
        while let Some(line) = lines.next_line().await? {
            header.push_str(&line);
            header.push('\n');
            count += 1;
            if count >= HEADER_LINES {
                break;
            }
        }
        Ok(header)
    }
}

#[async_trait]
impl Dumper for MysqldumpDumper {
    fn name(&self) -> &'static str {
        "mysqldump"
    }

    fn pack_strategy(&self) -> PackStrategy {
        PackStrategy::TarThenSplit
    }

    async fn init_config(&mut self, _version: &MysqlVersion, log_bin_disabled: bool) -> Result<()> {
        self.log_bin_disabled = log_bin_disabled;
        self.bin = find_tool(&self.cnf.public.tool_dir, &self.cnf.logical_backup_mysqldump.bin_path)?;
        self.log_file = weekday_log_file(&self.cnf.public.log_dir, "mysqldump", self.cnf.public.port)?;
        let public = &self.cnf.public;
        self.defaults = Some(write_client_defaults(&public.host, public.port, &public.user, &public.password)?);
        debug!("mysqldump using {}", self.bin.display());
        Ok(())
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        let defaults = self
            .defaults
            .as_ref()
            .ok_or_else(|| BackupError::config("mysqldump defaults file not initialised"))?;
        tokio::fs::create_dir_all(self.target.dir()).await?;

        let (databases, ignore) = self.resolve_targets().await?;
        if databases.is_empty() {
            return Err(BackupError::precheck("no database to dump"));
        }
        info!("Dumping databases: {}", databases.join(" "));

        if self.cnf.public.role.is_replica() {
            self.own_status = self.read_own_status().await?;
        }
        self.begin_time = now_string();
        create_command(&self.bin, defaults.path(), &self.result_file())
            .args(dump_args(&self.cnf, self.log_bin_disabled, &databases, &ignore))
            .log_to(&self.log_file, &["ERROR", "error", "Got error"])
            .run(ctx)
            .await?;
        self.end_time = now_string();
        debug!("-> Dumped!");
        Ok(())
    }

    async fn finalize_metadata(&mut self, _cnf: &BackupConfig, index: &mut IndexContent, _ctx: &TaskContext) -> Result<()> {
        index.backup_tool = self.name().to_string();
        index.backup_begin_time = self.begin_time.clone();
        index.backup_end_time = self.end_time.clone();
        index.backup_consistent_time = self.begin_time.clone();

        let header = self.read_header().await?;
        let parsed = parse_xtrabackup_slave_info(&header).ok();
        if self.cnf.public.role.is_replica() {
            set_master_status(index, self.own_status.take().unwrap_or_default());
            merge_slave_status(index, parsed);
        } else {
            match parsed {
                Some(status) => set_master_status(index, status),
                None if self.log_bin_disabled => set_master_status(index, BinlogStatus::default()),
                None => warn!("no CHANGE MASTER comment in {}", self.result_file().display()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ini::Ini;

    fn config(extra: &str) -> BackupConfig {
        let text = format!("[Public]\nuser=u\ncharset=utf8\n{}\n[LogicalBackup]\ndatabases=db1\nexclude_tables=t_tmp\n", extra);
        BackupConfig::from_ini(&Ini::load_from_str(&text).unwrap()).unwrap()
    }

    #[test]
    fn test_create_command_puts_defaults_first() {
        let exec = create_command(Path::new("mysqldump"), Path::new("/tmp/my.cnf"), Path::new("/tmp/out.sql"));
        assert_eq!(exec.get_args()[0], "--defaults-file=/tmp/my.cnf");
        assert!(exec.get_args().contains(&"--result-file=/tmp/out.sql".to_string()));
    }

    #[test]
    fn test_master_uses_master_data() {
        let cnf = config("role=master");
        let (dbs, ignore) = cnf.logical_backup.filter.mysqldump_targets().unwrap();
        let args = dump_args(&cnf, false, &dbs, &ignore);
        assert!(args.contains(&"--master-data=2".to_string()));
        assert!(args.contains(&"--ignore-table=db1.t_tmp".to_string()));
        assert_eq!(args[args.len() - 2..], ["--databases".to_string(), "db1".to_string()]);
    }

    #[test]
    fn test_replica_uses_dump_slave() {
        let cnf = config("role=slave\ndata_schema_grant=schema");
        let args = dump_args(&cnf, false, &["db1".to_string()], &[]);
        assert!(args.contains(&"--dump-slave=2".to_string()));
        assert!(!args.contains(&"--master-data=2".to_string()));
        assert!(args.contains(&"--no-data".to_string()));
    }

    #[test]
    fn test_no_binlog_no_master_data() {
        let args = dump_args(&config("role=master"), true, &["db1".to_string()], &[]);
        assert!(!args.iter().any(|a| a.starts_with("--master-data")));
    }
}
