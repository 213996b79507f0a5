use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::{error, info, warn};
use crate::config::BackupConfig;
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::IndexContent;
use crate::runner::{MyExec, XTRABACKUP_ERROR_KEYWORDS};
use crate::service::mysql::metadata::read_physical_metadata;
use crate::service::mysql::mysql_service::MySQLService;
use crate::service::mysql::xtrabackup::apply_physical_metadata;
use crate::service::service::{DumpTarget, Dumper, PackStrategy};
use crate::utils::{find_tool, now_string, weekday_log_file};
use crate::version::MysqlVersion;

pub fn build_args(cnf: &BackupConfig, backup_dir: &Path) -> Vec<String> {
    let public = &cnf.public;
    vec![
        format!("--defaults-file={}", cnf.physical_backup.defaults_file.display()),
        format!("--host={}", public.host),
        format!("--port={}", public.port),
        format!("--user={}", public.user),
        format!("--password={}", public.password),
        format!("--backup-dir={}", backup_dir.display()),
    ]
}

/// `tokudb_backup.pl` stops the slave threads itself and only restarts them on success.
pub struct TokudbDumper {
    cnf: BackupConfig,
    db: MySQLService,
    target: DumpTarget,
    bin: PathBuf,
    log_file: PathBuf,
    begin_time: String,
}

impl TokudbDumper {
    pub fn new(cnf: &BackupConfig, db: MySQLService, target: DumpTarget) -> TokudbDumper {
        TokudbDumper {
            cnf: cnf.clone(),
            db,
            target,
            bin: PathBuf::new(),
            log_file: PathBuf::new(),
            begin_time: String::new(),
        }
    }
}

#[async_trait]
impl Dumper for TokudbDumper {
    fn name(&self) -> &'static str {
        "tokudb_backup"
    }

    fn pack_strategy(&self) -> PackStrategy {
        PackStrategy::SplitStream
    }

    async fn init_config(&mut self, _version: &MysqlVersion, log_bin_disabled: bool) -> Result<()> {
        if log_bin_disabled {
            return Err(BackupError::precheck("tokudb backup requires log_bin"));
        }
        self.bin = find_tool(&self.cnf.public.tool_dir, "tokudb_backup.pl")?;
        self.log_file = weekday_log_file(&self.cnf.public.log_dir, "tokudb_backup", self.cnf.public.port)?;
        Ok(())
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        tokio::fs::create_dir_all(self.target.dir()).await?;
        self.begin_time = now_string();
        let result = MyExec::new("tokudb_backup", &self.bin)
            .args(build_args(&self.cnf, &self.target.dir()))
            .log_to(&self.log_file, &XTRABACKUP_ERROR_KEYWORDS)
            .run(ctx)
            .await;

        if let Err(e) = result {
            if self.cnf.public.role.is_replica() {
                error!("tokudb backup failed, restarting slave threads");
                if let Err(start_err) = self.db.start_slave().await {
                    warn!("{}", BackupError::Cleanup(format!("start slave: {}", start_err)));
                }
            }
            return Err(e);
        }
        info!("-> Dumped to {}", self.target.dir().display());
        Ok(())
    }

    async fn finalize_metadata(&mut self, cnf: &BackupConfig, index: &mut IndexContent, ctx: &TaskContext) -> Result<()> {
        index.backup_tool = self.name().to_string();
        index.backup_begin_time = self.begin_time.clone();
        let qpress = find_tool(&cnf.public.tool_dir, "qpress").ok();
        let meta = read_physical_metadata(&self.target.dir(), index.mysql_role.is_replica(), qpress.as_deref(), ctx).await?;
        apply_physical_metadata(index, meta);
        Ok(())
    }
}
