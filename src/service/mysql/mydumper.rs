use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info};
use tokio_util::sync::CancellationToken;
use crate::config::BackupConfig;
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::IndexContent;
use crate::runner::{MyExec, MYDUMPER_ERROR_KEYWORDS};
use crate::service::mysql::metadata::parse_mydumper_metadata;
use crate::service::service::{merge_slave_status, set_master_status, DumpTarget, Dumper, PackStrategy};
use crate::utils::{find_tool, now_string, split_extra_opt, weekday_log_file};
use crate::version::MysqlVersion;

/// Guard used when neither kill_long_query_time nor ftwrl_wait_timeout is set.
const LONG_QUERY_GUARD_UNLIMITED: u64 = 999_999;

pub struct MydumperDumper {
    cnf: BackupConfig,
    target: DumpTarget,
    bin: PathBuf,
    log_file: PathBuf,
    args: Vec<String>,
}

/// Everything but the binary, in the order mydumper documents them.
pub fn build_args(cnf: &BackupConfig, output_dir: &Path, supports_lock_wait: bool) -> Vec<String> {
    let public = &cnf.public;
    let logical = &cnf.logical_backup;
    let dsg = &public.data_schema_grant;

    let mut args = vec![
        format!("--host={}", public.host),
        format!("--port={}", public.port),
        format!("--user={}", public.user),
        format!("--password={}", public.password),
        format!("--outputdir={}", output_dir.display()),
        format!("--threads={}", logical.threads),
        format!("--chunk-filesize={}", logical.chunk_filesize),
        format!("--set-names={}", public.charset),
        "--long-query-retries=1".to_string(),
        "--verbose=2".to_string(),
    ];

    let guard = if public.kill_long_query_time > 0 {
        args.push("--kill-long-queries".to_string());
        public.kill_long_query_time
    } else if public.ftwrl_wait_timeout > 0 {
        public.ftwrl_wait_timeout
    } else {
        LONG_QUERY_GUARD_UNLIMITED
    };
    args.push(format!("--long-query-guard={}", guard));

    if supports_lock_wait {
        args.push(format!("--lock-wait-timeout={}", public.acquire_lock_wait_timeout));
    }
    if !logical.disable_compress {
        args.push("--compress".to_string());
    }
    if logical.trx_consistency_only {
        args.push("--trx-consistency-only".to_string());
    }
    args.extend(logical.filter.tool_args());

    if dsg.schema {
        args.push("--triggers".to_string());
        args.push("--events".to_string());
        args.push("--routines".to_string());
    } else {
        args.push("--no-schemas".to_string());
        args.push("--no-views".to_string());
    }
    if !dsg.data {
        args.push("--no-data".to_string());
    }
    args.extend(split_extra_opt(&logical.extra_opt));
    args
}

impl MydumperDumper {
    pub fn new(cnf: &BackupConfig, target: DumpTarget) -> MydumperDumper {
        MydumperDumper {
            cnf: cnf.clone(),
            target,
            bin: PathBuf::new(),
            log_file: PathBuf::new(),
            args: Vec::new(),
        }
    }

    /// Older mydumper builds reject `--lock-wait-timeout`.
    async fn supports_lock_wait(&self) -> bool {
        let probe = TaskContext::new(&CancellationToken::new(), Duration::from_millis(100));
        match MyExec::new("mydumper", &self.bin).arg("--help").allow_failure().run(&probe).await {
            Ok(out) => {
                let help = format!("{}{}", out.stdout_str(), out.stderr_str());
                help.contains("lock-wait-timeout")
            }
            Err(e) => {
                debug!("mydumper --help failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl Dumper for MydumperDumper {
    fn name(&self) -> &'static str {
        "mydumper"
    }

    fn pack_strategy(&self) -> PackStrategy {
        PackStrategy::TarParts
    }

    async fn init_config(&mut self, version: &MysqlVersion, log_bin_disabled: bool) -> Result<()> {
        if log_bin_disabled {
            info!("log_bin is off on {}, metadata will carry no binlog position", version);
        }
        self.bin = find_tool(&self.cnf.public.tool_dir, "mydumper")?;
        self.log_file = weekday_log_file(&self.cnf.public.log_dir, "mydumper", self.cnf.public.port)?;
        let lock_wait = self.supports_lock_wait().await;
        self.args = build_args(&self.cnf, &self.target.dir(), lock_wait);
        Ok(())
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        tokio::fs::create_dir_all(self.target.dir()).await?;
        MyExec::new("mydumper", &self.bin)
            .args(self.args.clone())
            .log_to(&self.log_file, &MYDUMPER_ERROR_KEYWORDS)
            .run(ctx)
            .await?;
        info!("mydumper finished: {}", self.target.dir().display());
        Ok(())
    }

    async fn finalize_metadata(&mut self, _cnf: &BackupConfig, index: &mut IndexContent, _ctx: &TaskContext) -> Result<()> {
        let path = self.target.dir().join("metadata");
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| BackupError::integrity(format!("read {}: {}", path.display(), e)))?;
        let meta = parse_mydumper_metadata(&text)?;

        index.backup_tool = self.name().to_string();
        index.backup_begin_time = meta.started.clone();
        index.backup_end_time = if meta.finished.is_empty() { now_string() } else { meta.finished.clone() };
        // The FTWRL moment is the consistent point of a logical dump.
        index.backup_consistent_time = meta.started;
        set_master_status(index, meta.master);
        merge_slave_status(index, meta.slave);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ini::Ini;

    fn config(dsg: &str) -> BackupConfig {
        let text = format!(
            "[Public]\nuser=ADMIN\npassword=pw\ncharset=utf8mb4\nftwrl_wait_timeout=60\ndata_schema_grant={}\n[LogicalBackup]\ndatabases=db1\n",
            dsg
        );
        BackupConfig::from_ini(&Ini::load_from_str(&text).unwrap()).unwrap()
    }

    #[test]
    fn test_args_for_full_dump() {
        let args = build_args(&config("all"), Path::new("/data/dbbak/t1"), true);
        assert!(args.contains(&"--outputdir=/data/dbbak/t1".to_string()));
        assert!(args.contains(&"--set-names=utf8mb4".to_string()));
        assert!(args.contains(&"--long-query-guard=60".to_string()));
        assert!(args.contains(&"--lock-wait-timeout=10".to_string()));
        assert!(args.contains(&"--compress".to_string()));
        assert!(args.contains(&"--routines".to_string()));
        assert!(!args.contains(&"--no-data".to_string()));
        let regex = args.iter().position(|a| a == "--regex").unwrap();
        assert!(args[regex + 1].contains("(db1)"));
    }

    #[test]
    fn test_args_for_schema_only() {
        let args = build_args(&config("schema"), Path::new("/tmp/t"), false);
        assert!(args.contains(&"--no-data".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--lock-wait-timeout")));
        assert!(!args.contains(&"--no-schemas".to_string()));
    }

    #[test]
    fn test_args_for_data_only() {
        let args = build_args(&config("data"), Path::new("/tmp/t"), false);
        assert!(args.contains(&"--no-schemas".to_string()));
        assert!(!args.contains(&"--triggers".to_string()));
    }
}
