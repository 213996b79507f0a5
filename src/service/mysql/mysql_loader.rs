use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::{info, warn};
use tempfile::NamedTempFile;
use crate::config::BackupConfig;
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::IndexContent;
use crate::runner::{MyExec, MYLOADER_ERROR_KEYWORDS};
use crate::service::mysql::guard::InitConnectGuard;
use crate::service::mysql::myloader::drop_databases;
use crate::service::mysql::mysql_defaults::write_client_defaults;
use crate::service::mysql::mysql_service::MySQLService;
use crate::service::service::Loader;
use crate::utils::{find_tool, split_extra_opt, weekday_log_file};

/// What the script holds decides which pre-load steps apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlScript {
    /// Single-file mysqldump output.
    Dump,
    /// `.priv` account script.
    Privileges,
}

pub fn build_args(cnf: &BackupConfig, charset: &str, defaults: &Path) -> Vec<String> {
    // --defaults-file must be the first option of the mysql client.
    let mut args = vec![
        format!("--defaults-file={}", defaults.display()),
        format!("--default-character-set={}", charset),
        "--max-allowed-packet=1G".to_string(),
    ];
    if !cnf.logical_load.enable_binlog {
        args.push("--init-command=SET sql_log_bin=0".to_string());
    }
    args.extend(split_extra_opt(&cnf.logical_load_mysqldump.extra_opt));
    args
}

/// Replays a SQL script through the `mysql` client.
pub struct MysqlLoader {
    cnf: BackupConfig,
    db: MySQLService,
    script: PathBuf,
    kind: SqlScript,
    bin: PathBuf,
    log_file: PathBuf,
    charset: String,
    defaults: Option<NamedTempFile>,
    guard: Option<InitConnectGuard>,
}

impl MysqlLoader {
    pub fn new(cnf: &BackupConfig, db: MySQLService, script: &Path, kind: SqlScript) -> MysqlLoader {
        MysqlLoader {
            cnf: cnf.clone(),
            db,
            script: script.to_path_buf(),
            kind,
            bin: PathBuf::new(),
            log_file: PathBuf::new(),
            charset: String::new(),
            defaults: None,
            guard: None,
        }
    }
}

#[async_trait]
impl Loader for MysqlLoader {
    fn name(&self) -> &'static str {
        "mysql"
    }

    async fn init_config(&mut self, index: &IndexContent) -> Result<()> {
        if !self.script.is_file() {
            return Err(BackupError::integrity(format!("{} not found", self.script.display())));
        }
        let public = &self.cnf.public;
        self.bin = find_tool(&public.tool_dir, &self.cnf.logical_load_mysqldump.bin_path)?;
        self.log_file = weekday_log_file(&public.log_dir, "mysql_load", public.port)?;
        self.charset = match (self.kind, index.backup_charset.as_str()) {
            (SqlScript::Privileges, _) | (_, "") => "utf8mb4".to_string(),
            (_, charset) => charset.to_string(),
        };
        self.defaults = Some(write_client_defaults(&public.host, public.port, &public.user, &public.password)?);
        Ok(())
    }

    async fn pre_load(&mut self, ctx: &TaskContext) -> Result<()> {
        ctx.check()?;
        if self.kind == SqlScript::Dump {
            self.guard = Some(InitConnectGuard::acquire(&self.db).await?);
            drop_databases(&self.db, &self.cnf.logical_load.db_list_drop_if_exists).await?;
        }
        Ok(())
    }

    async fn load(&mut self, ctx: &TaskContext) -> Result<()> {
        let defaults = self
            .defaults
            .as_ref()
            .ok_or_else(|| BackupError::config("mysql client defaults not initialised"))?;
        MyExec::new("mysql", &self.bin)
            .args(build_args(&self.cnf, &self.charset, defaults.path()))
            .stdin_file(&self.script)
            .log_to(&self.log_file, &MYLOADER_ERROR_KEYWORDS)
            .run(ctx)
            .await?;
        info!("loaded {}", self.script.display());
        Ok(())
    }

    async fn post_load(&mut self, _ctx: &TaskContext) -> Result<()> {
        if let Some(guard) = self.guard.take() {
            if let Err(e) = guard.release().await {
                warn!("{}", BackupError::Cleanup(format!("restore init_connect: {}", e)));
            }
        }
        Ok(())
    }
}
