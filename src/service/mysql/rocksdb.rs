use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::info;
use crate::config::BackupConfig;
use crate::context::TaskContext;
use crate::error::Result;
use crate::index::IndexContent;
use crate::runner::{MyExec, Pipeline, XTRABACKUP_ERROR_KEYWORDS};
use crate::service::mysql::metadata::read_physical_metadata;
use crate::service::mysql::xtrabackup::apply_physical_metadata;
use crate::service::service::{DumpTarget, Dumper, PackStrategy};
use crate::utils::{find_tool, now_string, weekday_log_file};
use crate::version::MysqlVersion;

pub fn build_args(cnf: &BackupConfig, checkpoint_dir: &Path) -> Vec<String> {
    let public = &cnf.public;
    let mut args = vec![
        format!("--mysql_user={}", public.user),
        format!("--mysql_password={}", public.password),
        format!("--mysql_port={}", public.port),
        format!("--checkpoint_dir={}", checkpoint_dir.display()),
        "--stream=xbstream".to_string(),
    ];
    if let Some(socket) = &public.socket {
        args.push(format!("--mysql_socket={}", socket));
    }
    args
}

/// `myrocks_hotbackup --stream=xbstream | xbstream -x -C <target>`.
pub struct RocksdbDumper {
    cnf: BackupConfig,
    target: DumpTarget,
    hotbackup: PathBuf,
    xbstream: PathBuf,
    log_file: PathBuf,
    begin_time: String,
}

impl RocksdbDumper {
    pub fn new(cnf: &BackupConfig, target: DumpTarget) -> RocksdbDumper {
        RocksdbDumper {
            cnf: cnf.clone(),
            target,
            hotbackup: PathBuf::new(),
            xbstream: PathBuf::new(),
            log_file: PathBuf::new(),
            begin_time: String::new(),
        }
    }

    fn checkpoint_dir(&self) -> PathBuf {
        self.target
            .backup_dir
            .join(format!("{}_checkpoint", self.target.target_name))
    }
}

#[async_trait]
impl Dumper for RocksdbDumper {
    fn name(&self) -> &'static str {
        "myrocks_hotbackup"
    }

    fn pack_strategy(&self) -> PackStrategy {
        PackStrategy::SplitStream
    }

    async fn init_config(&mut self, _version: &MysqlVersion, _log_bin_disabled: bool) -> Result<()> {
        self.hotbackup = find_tool(&self.cnf.public.tool_dir, "myrocks_hotbackup")?;
        self.xbstream = find_tool(&self.cnf.public.tool_dir, "xbstream")?;
        self.log_file = weekday_log_file(&self.cnf.public.log_dir, "myrocks_hotbackup", self.cnf.public.port)?;
        Ok(())
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        let checkpoint = self.checkpoint_dir();
        tokio::fs::create_dir_all(&checkpoint).await?;
        tokio::fs::create_dir_all(self.target.dir()).await?;
        self.begin_time = now_string();

        let dump = MyExec::new("myrocks_hotbackup", &self.hotbackup)
            .args(build_args(&self.cnf, &checkpoint))
            .stderr_log_to(&self.log_file, &XTRABACKUP_ERROR_KEYWORDS);
        let extract = MyExec::new("xbstream", &self.xbstream)
            .arg("-x")
            .arg("-C")
            .arg(self.target.dir().to_string_lossy())
            .log_to(&self.log_file, &XTRABACKUP_ERROR_KEYWORDS);
        let result = Pipeline::new(dump).pipe(extract).start()?.wait(ctx).await;

        // The tool leaves its checkpoint behind on failure too.
        if let Err(e) = tokio::fs::remove_dir_all(&checkpoint).await {
            info!("checkpoint dir {} not removed: {}", checkpoint.display(), e);
        }
        result?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use ini::Ini;

    #[test]
    fn test_build_args() {
        let cnf = BackupConfig::from_ini(&Ini::load_from_str("[Public]\nuser=u\npassword=p\nport=3310\n").unwrap()).unwrap();
        let args = build_args(&cnf, Path::new("/bak/t_checkpoint"));
        assert!(args.contains(&"--mysql_port=3310".to_string()));
        assert!(args.contains(&"--checkpoint_dir=/bak/t_checkpoint".to_string()));
        assert!(args.contains(&"--stream=xbstream".to_string()));
    }

    #[test]
    fn test_remote_stream_rejected() {
        let cnf = BackupConfig::from_ini(&Ini::load_from_str("[Public]\nuser=u\n").unwrap()).unwrap();
        let mut dumper = RocksdbDumper::new(&cnf, DumpTarget::new(PathBuf::from("/bak"), "t".to_string()));
        assert!(dumper.set_stream_target("10.0.0.5", 2345).is_err());
        assert!(!dumper.is_remote());
    }
}
