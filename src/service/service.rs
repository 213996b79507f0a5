use std::path::PathBuf;
use async_trait::async_trait;
use crate::config::BackupConfig;
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::{BinlogStatus, IndexContent};
use crate::version::MysqlVersion;

/// How the packager turns a finished dump directory into artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackStrategy {
    /// Self-contained `<target>_N.tar` files rotated on the size threshold.
    TarParts,
    /// One tar stream cut into `<target>.part_NN` byte ranges.
    SplitStream,
    /// `<target>.tar` first, split afterwards when it is over the threshold.
    TarThenSplit,
    /// Nothing to archive (grant-only).
    None,
}

/// Where one backup task writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpTarget {
    pub backup_dir: PathBuf,
    pub target_name: String,
}

impl DumpTarget {
    pub fn new(backup_dir: PathBuf, target_name: String) -> DumpTarget {
        DumpTarget {
            backup_dir,
            target_name,
        }
    }

    /// Working directory of the dumper.
    pub fn dir(&self) -> PathBuf {
        self.backup_dir.join(&self.target_name)
    }

    pub fn index_path(&self) -> PathBuf {
        self.backup_dir.join(format!("{}.index", self.target_name))
    }

    pub fn priv_path(&self) -> PathBuf {
        self.backup_dir.join(format!("{}.priv", self.target_name))
    }
}

#[async_trait]
pub trait Dumper: Send {
    /// Recorded as `backup_tool` in the index.
    fn name(&self) -> &'static str;

    fn pack_strategy(&self) -> PackStrategy;

    /// Artifacts land on the remote peer instead of the local disk.
    fn is_remote(&self) -> bool {
        false
    }

    /// Stream the dump to a receiver listening on `host:port`.
    fn set_stream_target(&mut self, host: &str, port: u16) -> Result<()> {
        Err(BackupError::precheck(format!(
            "{} cannot stream to remote {}:{}",
            self.name(),
            host,
            port
        )))
    }

    async fn init_config(&mut self, version: &MysqlVersion, log_bin_disabled: bool) -> Result<()>;

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()>;

    async fn finalize_metadata(&mut self, cnf: &BackupConfig, index: &mut IndexContent, ctx: &TaskContext) -> Result<()>;
}

#[async_trait]
pub trait Loader: Send {
    fn name(&self) -> &'static str;

    async fn init_config(&mut self, index: &IndexContent) -> Result<()>;

    async fn pre_load(&mut self, ctx: &TaskContext) -> Result<()>;

    async fn load(&mut self, ctx: &TaskContext) -> Result<()>;

    /// Runs even when `load` failed so guards restore server state.
    async fn post_load(&mut self, ctx: &TaskContext) -> Result<()>;
}

/// Record the dumped instance's own coordinates.
pub fn set_master_status(index: &mut IndexContent, mut status: BinlogStatus) {
    status.master_host = index.backup_host.clone();
    status.master_port = index.backup_port;
    index.binlog_info.show_master_status = status;
}

/// Fill the upstream coordinates a dump tool reported, keeping the upstream
/// host and port looked up before the dump when the tool does not print them.
pub fn merge_slave_status(index: &mut IndexContent, parsed: Option<BinlogStatus>) {
    if !index.mysql_role.is_replica() {
        index.binlog_info.show_slave_status = None;
        return;
    }
    let Some(parsed) = parsed else { return };
    let slot = index.binlog_info.show_slave_status.get_or_insert_with(BinlogStatus::default);
    slot.binlog_file = parsed.binlog_file;
    slot.binlog_pos = parsed.binlog_pos;
    slot.gtid = parsed.gtid;
    if !parsed.master_host.is_empty() {
        slot.master_host = parsed.master_host;
    }
    if parsed.master_port != 0 {
        slot.master_port = parsed.master_port;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupType, DataSchemaGrant, MysqlRole};

    fn index(role: MysqlRole) -> IndexContent {
        IndexContent::new(
            "id".to_string(),
            "10.0.0.9".to_string(),
            3306,
            role,
            BackupType::Physical,
            DataSchemaGrant::ALL,
        )
    }

    #[test]
    fn test_dump_target_paths() {
        let target = DumpTarget::new(PathBuf::from("/data/dbbak"), "t1".to_string());
        assert_eq!(target.dir(), PathBuf::from("/data/dbbak/t1"));
        assert_eq!(target.index_path(), PathBuf::from("/data/dbbak/t1.index"));
        assert_eq!(target.priv_path(), PathBuf::from("/data/dbbak/t1.priv"));
    }

    #[test]
    fn test_merge_slave_status_keeps_prefilled_upstream() {
        let mut idx = index(MysqlRole::Slave);
        idx.binlog_info.show_slave_status = Some(BinlogStatus {
            master_host: "10.0.0.1".to_string(),
            master_port: 3306,
            ..Default::default()
        });
        merge_slave_status(
            &mut idx,
            Some(BinlogStatus {
                binlog_file: "binlog.000100".to_string(),
                binlog_pos: "777".to_string(),
                ..Default::default()
            }),
        );
        let slave = idx.binlog_info.show_slave_status.unwrap();
        assert_eq!(slave.master_host, "10.0.0.1");
        assert_eq!(slave.master_port, 3306);
        assert_eq!(slave.binlog_pos, "777");
    }

    #[test]
    fn test_master_never_carries_slave_status() {
        let mut idx = index(MysqlRole::Master);
        merge_slave_status(&mut idx, Some(BinlogStatus::default()));
        assert!(idx.binlog_info.show_slave_status.is_none());

        set_master_status(&mut idx, BinlogStatus { binlog_file: "b.1".to_string(), ..Default::default() });
        assert_eq!(idx.binlog_info.show_master_status.master_host, "10.0.0.9");
        assert_eq!(idx.binlog_info.show_master_status.master_port, 3306);
    }
}
