use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use chrono::Local;
use ini::{Ini, Properties};
use log::{debug, info, warn};
use tempfile::NamedTempFile;
use crate::config::{BackupConfig, PublicConfig};
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::IndexContent;
use crate::runner::{MyExec, XTRABACKUP_ERROR_KEYWORDS};
use crate::service::mysql::mysql_defaults::{merge_backup_my_cnf, mysqld_section};
use crate::service::mysql::mysql_service::MySQLService;
use crate::service::mysql::repair::{myisamchk_system_tables, repair_account_hosts, repair_admin, repair_myisam_tables};
use crate::service::mysql::xtrabackup::resolve_binary;
use crate::service::service::Loader;
use crate::throttle::remove_dir_limited;
use crate::utils::{find_tool, weekday_log_file};
use crate::version::{MysqlVersion, XtrabackupTool};

const BACKUP_MY_CNF: &str = "backup-my.cnf";
const PREPARE_MEMORY: &str = "--use-memory=1G";
const START_POLL: Duration = Duration::from_secs(2);

pub fn decompress_args(tool: XtrabackupTool, dir: &Path, threads: u32) -> Vec<String> {
    if tool.is_innobackupex() {
        return vec!["--decompress".to_string(), dir.display().to_string()];
    }
    vec![
        "--decompress".to_string(),
        "--remove-original".to_string(),
        format!("--parallel={}", threads),
        format!("--target-dir={}", dir.display()),
    ]
}

pub fn prepare_args(tool: XtrabackupTool, dir: &Path) -> Vec<String> {
    if tool.is_innobackupex() {
        return vec!["--apply-log".to_string(), PREPARE_MEMORY.to_string(), dir.display().to_string()];
    }
    vec![
        "--prepare".to_string(),
        PREPARE_MEMORY.to_string(),
        format!("--target-dir={}", dir.display()),
    ]
}

pub fn restore_args(tool: XtrabackupTool, defaults_file: &Path, dir: &Path, copy_back: bool, threads: u32) -> Vec<String> {
    let mode = if copy_back { "--copy-back" } else { "--move-back" };
    let mut args = vec![format!("--defaults-file={}", defaults_file.display()), mode.to_string()];
    if tool.is_innobackupex() {
        args.push(dir.display().to_string());
    } else {
        args.push(format!("--parallel={}", threads));
        args.push(format!("--target-dir={}", dir.display()));
    }
    args
}

/// Directories the restored files land in: data, InnoDB, binlog and relay log.
/// Directories nested in an earlier one are dropped.
pub fn dirs_to_clean(mysqld: &Properties) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for key in ["datadir", "innodb_data_home_dir", "innodb_log_group_home_dir"] {
        if let Some(value) = mysqld.get(key).map(str::trim).filter(|v| !v.is_empty()) {
            dirs.push(PathBuf::from(value));
        }
    }
    for key in ["log_bin", "log-bin", "relay_log", "relay-log"] {
        if let Some(value) = mysqld.get(key).map(str::trim).filter(|v| v.starts_with('/')) {
            if let Some(parent) = Path::new(value).parent() {
                dirs.push(parent.to_path_buf());
            }
        }
    }
    dirs.sort();
    dirs.dedup();
    let mut outermost: Vec<PathBuf> = Vec::new();
    for dir in dirs {
        if !outermost.iter().any(|o| dir.starts_with(o)) {
            outermost.push(dir);
        }
    }
    outermost
}

/// Empty `dir`, either by deleting its contents or by renaming it aside.
pub fn clean_dir(dir: &Path, rename_suffix: Option<&str>, io_limit: u64) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        return Ok(());
    }
    match rename_suffix {
        Some(suffix) => {
            let mut renamed = dir.as_os_str().to_owned();
            renamed.push(format!("_bak_{}", suffix));
            info!("rename {} to {}", dir.display(), Path::new(&renamed).display());
            std::fs::rename(dir, &renamed)?;
        }
        None => {
            info!("remove {}", dir.display());
            remove_dir_limited(dir, io_limit)?;
        }
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

fn has_qpress_files(dir: &Path) -> Result<bool> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if has_qpress_files(&path)? {
                return Ok(true);
            }
        } else if path.extension().map(|e| e == "qp").unwrap_or(false) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Restores an xtrabackup directory into the local instance and brings it up.
pub struct PhysicalLoader {
    cnf: BackupConfig,
    dir: PathBuf,
    tool: Option<XtrabackupTool>,
    bin: PathBuf,
    log_file: PathBuf,
    version: Option<MysqlVersion>,
    source_host: String,
    backup_my_cnf: Option<NamedTempFile>,
    db: Option<MySQLService>,
}

impl PhysicalLoader {
    pub fn new(cnf: &BackupConfig, dir: &Path) -> PhysicalLoader {
        PhysicalLoader {
            cnf: cnf.clone(),
            dir: dir.to_path_buf(),
            tool: None,
            bin: PathBuf::new(),
            log_file: PathBuf::new(),
            version: None,
            source_host: String::new(),
            backup_my_cnf: None,
            db: None,
        }
    }

    fn tool(&self) -> Result<XtrabackupTool> {
        self.tool.ok_or_else(|| BackupError::config("physical loader not initialised"))
    }

    fn xtrabackup(&self) -> MyExec {
        MyExec::new("xtrabackup", &self.bin).log_to(&self.log_file, &XTRABACKUP_ERROR_KEYWORDS)
    }

    fn target_cnf(&self) -> Result<Properties> {
        let conf = Ini::load_from_file(&self.cnf.physical_load.defaults_file)?;
        Ok(mysqld_section(&conf, Some(self.cnf.public.port)))
    }

    async fn start_mysqld(&self, ctx: &TaskContext) -> Result<()> {
        let load = &self.cnf.physical_load;
        let script = if load.start_command.is_empty() {
            let mysqld_safe = find_tool(&self.cnf.public.tool_dir, "mysqld_safe")?;
            format!(
                "nohup {} --defaults-file={} --skip-grant-tables >/dev/null 2>&1 &",
                mysqld_safe.display(),
                load.defaults_file.display()
            )
        } else {
            load.start_command.clone()
        };
        MyExec::new("start mysqld", "sh").arg("-c").arg(script).run(ctx).await?;
        Ok(())
    }

    /// Connect through the socket when the config names one; skip-grant-tables disables TCP on 8.0.
    async fn wait_for_mysqld(&self, mysqld: &Properties, ctx: &TaskContext) -> Result<MySQLService> {
        let mut public: PublicConfig = self.cnf.public.clone();
        if public.socket.is_none() {
            public.socket = mysqld.get("socket").map(str::to_string);
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.cnf.physical_load.start_wait_secs);
        loop {
            ctx.check()?;
            match MySQLService::connect(&public).await {
                Ok(db) => return Ok(db),
                Err(e) if tokio::time::Instant::now() < deadline => {
                    debug!("mysqld not ready: {}", e);
                    tokio::time::sleep(START_POLL).await;
                }
                Err(e) => {
                    return Err(BackupError::precheck(format!(
                        "mysqld on port {} did not come up: {}",
                        public.port, e
                    )))
                }
            }
        }
    }

    async fn repair(&self, db: &MySQLService, version: &MysqlVersion) -> Result<()> {
        let target_host = &self.cnf.public.host;
        if matches!(target_host.as_str(), "localhost" | "127.0.0.1" | "::1") {
            warn!("target host {} is loopback, account hosts kept as {}", target_host, self.source_host);
        } else {
            repair_account_hosts(db, &self.source_host, target_host, version).await?;
        }
        repair_admin(db, target_host, &self.cnf.public.password, version).await?;
        repair_myisam_tables(db).await?;
        db.exec("FLUSH PRIVILEGES").await?;
        Ok(())
    }
}

#[async_trait]
impl Loader for PhysicalLoader {
    fn name(&self) -> &'static str {
        "xtrabackup"
    }

    async fn init_config(&mut self, index: &IndexContent) -> Result<()> {
        let engine = index.storage_engine.to_ascii_uppercase();
        if engine == "ROCKSDB" || engine == "TOKUDB" {
            return Err(BackupError::precheck(format!(
                "restore of {} physical backups is not supported",
                engine
            )));
        }
        let version = MysqlVersion::parse(&index.mysql_version)?;
        let (tool, bin) = resolve_binary(&self.cnf.public.tool_dir, &version)?;
        self.tool = Some(tool);
        self.bin = bin;
        self.version = Some(version);
        self.source_host = index.backup_host.clone();
        self.log_file = weekday_log_file(&self.cnf.public.log_dir, "xtrabackup_load", self.cnf.public.port)?;
        Ok(())
    }

    async fn pre_load(&mut self, ctx: &TaskContext) -> Result<()> {
        let tool = self.tool()?;
        let threads = self.cnf.physical_load.threads;
        if has_qpress_files(&self.dir)? {
            info!("decompress {}", self.dir.display());
            self.xtrabackup().args(decompress_args(tool, &self.dir, threads)).run(ctx).await?;
        }
        info!("prepare {}", self.dir.display());
        self.xtrabackup().args(prepare_args(tool, &self.dir)).run(ctx).await?;

        let saved = self.dir.join(BACKUP_MY_CNF);
        if saved.is_file() {
            let copy = NamedTempFile::new()?;
            tokio::fs::copy(&saved, copy.path()).await?;
            self.backup_my_cnf = Some(copy);
        }

        let mysqld = self.target_cnf()?;
        let suffix = Local::now().format("%Y%m%d%H%M%S").to_string();
        let rename = self.cnf.physical_load.rename_original_dir;
        let io_limit = self.cnf.io_limit_bytes();
        let dirs = dirs_to_clean(&mysqld);
        if dirs.is_empty() {
            return Err(BackupError::config(format!(
                "no datadir in {}",
                self.cnf.physical_load.defaults_file.display()
            )));
        }
        tokio::task::spawn_blocking(move || {
            for dir in &dirs {
                clean_dir(dir, rename.then_some(suffix.as_str()), io_limit)?;
            }
            Ok::<(), BackupError>(())
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        Ok(())
    }

    async fn load(&mut self, ctx: &TaskContext) -> Result<()> {
        let tool = self.tool()?;
        let load = &self.cnf.physical_load;
        self.xtrabackup()
            .args(restore_args(tool, &load.defaults_file, &self.dir, load.copy_back, load.threads))
            .run(ctx)
            .await?;

        if let Some(saved) = &self.backup_my_cnf {
            merge_backup_my_cnf(saved.path(), &load.defaults_file, Some(self.cnf.public.port))?;
        }
        let mysqld = self.target_cnf()?;
        if let Some(datadir) = mysqld.get("datadir") {
            let repaired = myisamchk_system_tables(&self.cnf.public.tool_dir, Path::new(datadir), ctx).await?;
            debug!("myisamchk repaired {} system indexes", repaired);
        }

        self.start_mysqld(ctx).await?;
        let db = self.wait_for_mysqld(&mysqld, ctx).await?;
        let version = self
            .version
            .clone()
            .ok_or_else(|| BackupError::config("physical loader not initialised"))?;
        self.repair(&db, &version).await?;
        self.db = Some(db);
        info!("physical restore of {} done", self.dir.display());
        Ok(())
    }

    async fn post_load(&mut self, _ctx: &TaskContext) -> Result<()> {
        if let Some(db) = self.db.take() {
            db.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_xtrabackup_args() {
        let dir = Path::new("/load/t");
        assert_eq!(
            prepare_args(XtrabackupTool::Xtrabackup57, dir),
            vec!["--prepare", "--use-memory=1G", "--target-dir=/load/t"]
        );
        assert_eq!(
            prepare_args(XtrabackupTool::Innobackupex51, dir),
            vec!["--apply-log", "--use-memory=1G", "/load/t"]
        );
        let restore = restore_args(XtrabackupTool::Xtrabackup80, Path::new("/etc/my.cnf"), dir, true, 4);
        assert_eq!(restore[0], "--defaults-file=/etc/my.cnf");
        assert_eq!(restore[1], "--copy-back");
        assert!(decompress_args(XtrabackupTool::Xtrabackup57, dir, 4).contains(&"--remove-original".to_string()));
    }

    #[test]
    fn test_dirs_to_clean() {
        let conf = Ini::load_from_str(
            "[mysqld]\ndatadir=/data/mysql/3306/data\ninnodb_data_home_dir=/data/mysql/3306/innodb/data\n\
             innodb_log_group_home_dir=/data/mysql/3306/innodb/log\nlog_bin=/data/mysql/3306/binlog/binlog3306.bin\n\
             relay_log=/data/mysql/3306/data/relay-log.bin\n",
        )
        .unwrap();
        let dirs = dirs_to_clean(&mysqld_section(&conf, None));
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/data/mysql/3306/binlog"),
                PathBuf::from("/data/mysql/3306/data"),
                PathBuf::from("/data/mysql/3306/innodb/data"),
                PathBuf::from("/data/mysql/3306/innodb/log"),
            ]
        );
    }

    #[test]
    fn test_clean_dir() {
        let root = TempDir::new().unwrap();
        let data = root.path().join("data");
        std::fs::create_dir_all(data.join("app")).unwrap();
        std::fs::write(data.join("app").join("t.ibd"), b"x").unwrap();

        clean_dir(&data, Some("20240102030405"), 0).unwrap();
        assert!(data.is_dir());
        assert_eq!(std::fs::read_dir(&data).unwrap().count(), 0);
        assert!(root.path().join("data_bak_20240102030405").join("app").join("t.ibd").is_file());

        std::fs::write(data.join("ibdata1"), b"x").unwrap();
        clean_dir(&data, None, 0).unwrap();
        assert_eq!(std::fs::read_dir(&data).unwrap().count(), 0);
    }
}
