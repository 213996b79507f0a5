use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use crate::config::BackupConfig;
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::IndexContent;
use crate::runner::{MyExec, Pipeline, XTRABACKUP_ERROR_KEYWORDS};
use crate::service::mysql::guard::ReplicaParallelGuard;
use crate::service::mysql::metadata::{read_physical_metadata, PhysicalMetadata};
use crate::service::mysql::mysql_service::MySQLService;
use crate::service::service::{merge_slave_status, set_master_status, DumpTarget, Dumper, PackStrategy};
use crate::utils::{find_tool, now_string, split_extra_opt, weekday_log_file};
use crate::version::{MysqlVersion, XtrabackupTool};

/// Locate the xtrabackup build matching this server version and flavor.
pub fn resolve_binary(tool_dir: &Path, version: &MysqlVersion) -> Result<(XtrabackupTool, PathBuf)> {
    let tool = version.xtrabackup_tool()?;
    let dir = tool_dir.join(XtrabackupTool::flavor_dir(version.flavor));
    let bin = find_tool(&dir, tool.binary_name())?;
    debug!("xtrabackup binary for {}: {}", version, bin.display());
    Ok((tool, bin))
}

/// netcat flavors disagree on how to close after EOF.
pub fn choose_nc_send_flag(help_output: &str) -> &'static str {
    let lower = help_output.to_ascii_lowercase();
    if lower.contains("invalid option") || lower.contains("unrecognized option") || lower.contains("illegal option") {
        "--send-only"
    } else {
        "-N"
    }
}

pub fn build_args(cnf: &BackupConfig, tool: XtrabackupTool, target_dir: &Path, stream: bool) -> Vec<String> {
    let public = &cnf.public;
    let physical = &cnf.physical_backup;

    // The defaults file has to be the first option.
    let mut args = vec![format!("--defaults-file={}", physical.defaults_file.display())];
    if !tool.is_innobackupex() {
        args.push("--backup".to_string());
    }
    args.push(format!("--host={}", public.host));
    args.push(format!("--port={}", public.port));
    args.push(format!("--user={}", public.user));
    args.push(format!("--password={}", public.password));
    if tool.is_innobackupex() {
        args.push("--no-timestamp".to_string());
    } else {
        args.push(format!("--target-dir={}", target_dir.display()));
    }
    args.push(format!("--parallel={}", physical.threads));
    args.push("--compress".to_string());
    args.push(format!("--compress-threads={}", physical.threads));

    if public.role.is_replica() {
        args.push("--slave-info".to_string());
    }
    if physical.lock_ddl && tool.supports_lock_ddl() {
        args.push("--lock-ddl".to_string());
        if tool == XtrabackupTool::Xtrabackup80 {
            args.push(format!("--backup-lock-timeout={}", public.acquire_lock_wait_timeout));
        }
    }
    if tool.supports_ftwrl_wait() && public.ftwrl_wait_timeout > 0 {
        args.push(format!("--ftwrl-wait-timeout={}", public.ftwrl_wait_timeout));
    }
    if public.kill_long_query_time > 0 {
        args.push(format!("--kill-long-queries-timeout={}", public.kill_long_query_time));
    }
    if tool.supports_binlog_info() {
        args.push("--binlog-info=ON".to_string());
    }
    if physical.throttle > 0 {
        args.push(format!("--throttle={}", physical.throttle));
    }
    if stream {
        args.push("--stream=xbstream".to_string());
    }
    args.extend(split_extra_opt(&physical.extra_opt));
    if tool.is_innobackupex() {
        args.push(target_dir.display().to_string());
    }
    args
}

/// Copy sidecar metadata into the index; shared with the remote tar-upload step.
pub fn apply_physical_metadata(index: &mut IndexContent, meta: PhysicalMetadata) {
    if !meta.begin_time.is_empty() {
        index.backup_begin_time = meta.begin_time;
    }
    index.backup_end_time = if meta.end_time.is_empty() { now_string() } else { meta.end_time };
    index.backup_consistent_time = if meta.consistent_time.is_empty() {
        index.backup_end_time.clone()
    } else {
        meta.consistent_time
    };
    set_master_status(index, meta.master);
    merge_slave_status(index, meta.slave);
}

struct StreamTarget {
    host: String,
    port: u16,
}

pub struct XtrabackupDumper {
    cnf: BackupConfig,
    db: MySQLService,
    target: DumpTarget,
    tool: Option<XtrabackupTool>,
    bin: PathBuf,
    log_file: PathBuf,
    stream: Option<StreamTarget>,
    begin_time: String,
}

impl XtrabackupDumper {
    pub fn new(cnf: &BackupConfig, db: MySQLService, target: DumpTarget) -> XtrabackupDumper {
        XtrabackupDumper {
            cnf: cnf.clone(),
            db,
            target,
            tool: None,
            bin: PathBuf::new(),
            log_file: PathBuf::new(),
            stream: None,
            begin_time: String::new(),
        }
    }

    async fn nc_send_flag(&self, nc: &Path) -> &'static str {
        let probe = TaskContext::new(&CancellationToken::new(), Duration::from_millis(100));
        match MyExec::new("nc", nc).args(["-N", "-h"]).allow_failure().run(&probe).await {
            Ok(out) => choose_nc_send_flag(&format!("{}{}", out.stdout_str(), out.stderr_str())),
            Err(e) => {
                warn!("probe nc failed: {}, assuming -N", e);
                "-N"
            }
        }
    }

    async fn run_dump(&self, ctx: &TaskContext) -> Result<()> {
        let tool = self
            .tool
            .ok_or_else(|| BackupError::config("xtrabackup is not initialised"))?;
        let args = build_args(&self.cnf, tool, &self.target.dir(), self.stream.is_some());
        let dump = MyExec::new("xtrabackup", &self.bin).args(args);

        match &self.stream {
            None => {
                dump.log_to(&self.log_file, &XTRABACKUP_ERROR_KEYWORDS).run(ctx).await?;
            }
            Some(stream) => {
                let nc = find_tool(&self.cnf.public.tool_dir, "nc")?;
                let flag = self.nc_send_flag(&nc).await;
                let sender = MyExec::new("nc", &nc)
                    .arg(flag)
                    .arg(stream.host.as_str())
                    .arg(stream.port.to_string())
                    .stderr_log_to(&self.log_file, &["refused", "failed", "error"]);
                Pipeline::new(dump.stderr_log_to(&self.log_file, &XTRABACKUP_ERROR_KEYWORDS))
                    .pipe(sender)
                    .start()?
                    .wait(ctx)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Dumper for XtrabackupDumper {
    fn name(&self) -> &'static str {
        "xtrabackup"
    }

    fn pack_strategy(&self) -> PackStrategy {
        PackStrategy::SplitStream
    }

    fn is_remote(&self) -> bool {
        self.stream.is_some()
    }

    fn set_stream_target(&mut self, host: &str, port: u16) -> Result<()> {
        self.stream = Some(StreamTarget {
            host: host.to_string(),
            port,
        });
        Ok(())
    }

    async fn init_config(&mut self, version: &MysqlVersion, _log_bin_disabled: bool) -> Result<()> {
        let (tool, bin) = resolve_binary(&self.cnf.public.tool_dir, version)?;
        self.tool = Some(tool);
        self.bin = bin;
        self.log_file = weekday_log_file(&self.cnf.public.log_dir, "xtrabackup", self.cnf.public.port)?;
        Ok(())
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        tokio::fs::create_dir_all(self.target.dir()).await?;
        let guard = if self.cnf.public.role.is_replica() && self.cnf.physical_backup.disable_slave_multi_thread {
            Some(ReplicaParallelGuard::acquire(&self.db).await?)
        } else {
            None
        };

        self.begin_time = now_string();
        let result = self.run_dump(ctx).await;

        if let Some(guard) = guard {
            if let Err(e) = guard.release().await {
                warn!("{}", BackupError::Cleanup(e.to_string()));
            }
        }
        result?;
        info!("-> Dumped to {}", self.target.dir().display());
        Ok(())
    }

    async fn finalize_metadata(&mut self, cnf: &BackupConfig, index: &mut IndexContent, ctx: &TaskContext) -> Result<()> {
        index.backup_tool = self.name().to_string();
        index.backup_begin_time = self.begin_time.clone();
        if self.stream.is_some() {
            info!("metadata of a streamed backup is read on the remote side");
            return Ok(());
        }
        let qpress = find_tool(&cnf.public.tool_dir, "qpress").ok();
        let meta = read_physical_metadata(&self.target.dir(), index.mysql_role.is_replica(), qpress.as_deref(), ctx).await?;
        apply_physical_metadata(index, meta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupType, DataSchemaGrant, MysqlRole};
    use crate::index::BinlogStatus;
    use ini::Ini;

    fn config(extra: &str) -> BackupConfig {
        let text = format!(
            "[Public]\nuser=ADMIN\npassword=pw\n{}\n[PhysicalBackup]\ndefaults_file=/etc/my.cnf.3306\nthreads=2\nlock_ddl=true\nthrottle=100\n",
            extra
        );
        BackupConfig::from_ini(&Ini::load_from_str(&text).unwrap()).unwrap()
    }

    #[test]
    fn test_args_for_57_replica() {
        let args = build_args(&config("role=slave"), XtrabackupTool::Xtrabackup57, Path::new("/bak/t"), false);
        assert_eq!(args[0], "--defaults-file=/etc/my.cnf.3306");
        assert_eq!(args[1], "--backup");
        assert!(args.contains(&"--target-dir=/bak/t".to_string()));
        assert!(args.contains(&"--slave-info".to_string()));
        assert!(args.contains(&"--lock-ddl".to_string()));
        assert!(args.contains(&"--binlog-info=ON".to_string()));
        assert!(args.contains(&"--throttle=100".to_string()));
        assert!(!args.contains(&"--stream=xbstream".to_string()));
    }

    #[test]
    fn test_args_for_innobackupex_stream() {
        let args = build_args(&config("role=master"), XtrabackupTool::Innobackupex51, Path::new("/bak/t"), true);
        assert!(!args.contains(&"--backup".to_string()));
        assert!(!args.contains(&"--lock-ddl".to_string()));
        assert!(args.contains(&"--stream=xbstream".to_string()));
        assert_eq!(args.last().unwrap(), "/bak/t");
    }

    #[test]
    fn test_nc_flag() {
        assert_eq!(choose_nc_send_flag("OpenBSD netcat (Debian patchlevel 1.206-1)\nusage: nc [-46CDdFhklNnrStUuvZz]"), "-N");
        assert_eq!(choose_nc_send_flag("Ncat: invalid option -- 'N'"), "--send-only");
    }

    #[test]
    fn test_apply_physical_metadata() {
        let mut index = IndexContent::new(
            "id".to_string(),
            "10.0.0.9".to_string(),
            3306,
            MysqlRole::Repeater,
            BackupType::Physical,
            DataSchemaGrant::ALL,
        );
        index.binlog_info.show_slave_status = Some(BinlogStatus {
            master_host: "10.0.0.1".to_string(),
            master_port: 3306,
            ..Default::default()
        });
        let meta = PhysicalMetadata {
            begin_time: "2024-01-02 03:00:00".to_string(),
            end_time: "2024-01-02 03:30:00".to_string(),
            consistent_time: String::new(),
            master: BinlogStatus { binlog_file: "binlog.000003".to_string(), binlog_pos: "154".to_string(), ..Default::default() },
            slave: Some(BinlogStatus { binlog_file: "binlog.000100".to_string(), binlog_pos: "777".to_string(), ..Default::default() }),
            tool_version: "2.4.20".to_string(),
        };
        apply_physical_metadata(&mut index, meta);
        assert_eq!(index.backup_consistent_time, "2024-01-02 03:30:00");
        assert_eq!(index.binlog_info.show_master_status.master_host, "10.0.0.9");
        let slave = index.binlog_info.show_slave_status.unwrap();
        assert_eq!(slave.master_host, "10.0.0.1");
        assert_eq!(slave.binlog_file, "binlog.000100");
    }
}
