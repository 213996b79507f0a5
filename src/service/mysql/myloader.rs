use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::{info, warn};
use tempfile::NamedTempFile;
use crate::config::{is_system_db, BackupConfig};
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::IndexContent;
use crate::runner::{MyExec, MYLOADER_ERROR_KEYWORDS};
use crate::service::mysql::guard::InitConnectGuard;
use crate::service::mysql::mysql_defaults::write_myloader_defaults;
use crate::service::mysql::mysql_service::{quote_ident, MySQLService};
use crate::service::service::Loader;
use crate::utils::{find_tool, split_extra_opt, weekday_log_file};

/// Databases from `db_list_drop_if_exists` that may be dropped: not system, and present.
pub fn databases_to_drop(requested: &[String], present: &[String]) -> Result<Vec<String>> {
    if let Some(db) = requested.iter().find(|db| is_system_db(db)) {
        return Err(BackupError::config(format!(
            "refuse to drop system database '{}'",
            db
        )));
    }
    Ok(requested
        .iter()
        .filter(|db| present.contains(db))
        .cloned()
        .collect())
}

pub async fn drop_databases(db: &MySQLService, requested: &[String]) -> Result<()> {
    if requested.is_empty() {
        return Ok(());
    }
    let present = db.databases().await?;
    for name in databases_to_drop(requested, &present)? {
        warn!("drop database {} before load", name);
        db.exec(&format!("DROP DATABASE IF EXISTS {}", quote_ident(&name))).await?;
    }
    Ok(())
}

pub fn build_args(cnf: &BackupConfig, charset: &str, dir: &Path, defaults: &Path) -> Vec<String> {
    let public = &cnf.public;
    let load = &cnf.logical_load;
    let mut args = vec![
        format!("--defaults-file={}", defaults.display()),
        format!("--host={}", public.host),
        format!("--port={}", public.port),
        format!("--user={}", public.user),
        format!("--password={}", public.password),
        format!("--directory={}", dir.display()),
        format!("--threads={}", load.threads),
        format!("--set-names={}", charset),
        "--verbose=2".to_string(),
    ];
    args.extend(load.filter.tool_args());
    if load.schema_only {
        args.push("--no-data".to_string());
    }
    if load.create_table_if_not_exists {
        args.push("--append-if-not-exist".to_string());
    }
    if load.enable_binlog {
        args.push("--enable-binlog".to_string());
    }
    args.extend(split_extra_opt(&load.extra_opt));
    args
}

/// Loads a mydumper directory with myloader.
pub struct MyloaderLoader {
    cnf: BackupConfig,
    db: MySQLService,
    dir: PathBuf,
    bin: PathBuf,
    log_file: PathBuf,
    charset: String,
    defaults: Option<NamedTempFile>,
    guard: Option<InitConnectGuard>,
}

impl MyloaderLoader {
    pub fn new(cnf: &BackupConfig, db: MySQLService, dir: &Path) -> MyloaderLoader {
        MyloaderLoader {
            cnf: cnf.clone(),
            db,
            dir: dir.to_path_buf(),
            bin: PathBuf::new(),
            log_file: PathBuf::new(),
            charset: String::new(),
            defaults: None,
            guard: None,
        }
    }
}

#[async_trait]
impl Loader for MyloaderLoader {
    fn name(&self) -> &'static str {
        "myloader"
    }

    async fn init_config(&mut self, index: &IndexContent) -> Result<()> {
        self.bin = find_tool(&self.cnf.public.tool_dir, "myloader")?;
        self.log_file = weekday_log_file(&self.cnf.public.log_dir, "myloader", self.cnf.public.port)?;
        self.charset = if index.backup_charset.is_empty() {
            "binary".to_string()
        } else {
            index.backup_charset.clone()
        };
        self.defaults = Some(write_myloader_defaults(&self.cnf.logical_load.init_command)?);
        Ok(())
    }

    async fn pre_load(&mut self, ctx: &TaskContext) -> Result<()> {
        ctx.check()?;
        self.guard = Some(InitConnectGuard::acquire(&self.db).await?);
        drop_databases(&self.db, &self.cnf.logical_load.db_list_drop_if_exists).await
    }

    async fn load(&mut self, ctx: &TaskContext) -> Result<()> {
        let defaults = self
            .defaults
            .as_ref()
            .ok_or_else(|| BackupError::config("myloader defaults not initialised"))?;
        let args = build_args(&self.cnf, &self.charset, &self.dir, defaults.path());
        MyExec::new("myloader", &self.bin)
            .args(args)
            .log_to(&self.log_file, &MYLOADER_ERROR_KEYWORDS)
            .run(ctx)
            .await?;
        info!("myloader finished loading {}", self.dir.display());
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

#[cfg(test)]
mod tests {
    use super::*;
    use ini::Ini;

    #[test]
    fn test_databases_to_drop() {
        let present = vec!["app".to_string(), "mysql".to_string()];
        let dropped = databases_to_drop(&["app".to_string(), "gone".to_string()], &present).unwrap();
        assert_eq!(dropped, vec!["app"]);

        let err = databases_to_drop(&["app".to_string(), "mysql".to_string()], &present).unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_build_args() {
        let conf = Ini::load_from_str(
            "[Public]\nuser=u\npassword=secret\n[LogicalLoad]\nthreads=8\nschema_only=true\n\
             create_table_if_not_exists=true\ntables_list=app.t1\n",
        )
        .unwrap();
        let cnf = BackupConfig::from_ini(&conf).unwrap();
        let args = build_args(&cnf, "utf8mb4", Path::new("/load/t"), Path::new("/tmp/d.cnf"));
        assert_eq!(args[0], "--defaults-file=/tmp/d.cnf");
        assert!(args.contains(&"--threads=8".to_string()));
        assert!(args.contains(&"--set-names=utf8mb4".to_string()));
        assert!(args.contains(&"--no-data".to_string()));
        assert!(args.contains(&"--append-if-not-exist".to_string()));
        assert!(!args.contains(&"--enable-binlog".to_string()));
        let pos = args.iter().position(|a| a == "--tables-list").unwrap();
        assert_eq!(args[pos + 1], "app.t1");
    }
}
