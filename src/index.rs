use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use crate::config::{BackupType, DataSchemaGrant, MysqlRole};
use crate::error::{BackupError, Result};

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Binlog coordinates. For `show_master_status` the host/port identify the
/// instance that was dumped; for `show_slave_status` they identify its upstream.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BinlogStatus {
    #[serde(default)]
    pub binlog_file: String,
    #[serde(default)]
    pub binlog_pos: String,
    #[serde(default)]
    pub gtid: String,
    #[serde(default)]
    pub master_host: String,
    #[serde(default)]
    pub master_port: u16,
}

impl BinlogStatus {
    pub fn is_empty(&self) -> bool {
        self.binlog_file.is_empty() && self.gtid.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BinlogInfo {
    #[serde(default)]
    pub show_master_status: BinlogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_slave_status: Option<BinlogStatus>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Tar,
    Part,
    Priv,
    Index,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::Tar => "tar",
            FileType::Part => "part",
            FileType::Priv => "priv",
            FileType::Index => "index",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TarFileItem {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: FileType,
    #[serde(default)]
    pub contain_files: Vec<String>,
}

/// The `.index` document: the single hand-off between backup, upload and restore.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IndexContent {
    pub backup_id: String,
    #[serde(default)]
    pub bill_id: String,
    #[serde(default)]
    pub cluster_id: i64,
    #[serde(default)]
    pub cluster_address: String,
    #[serde(default = "default_shard")]
    pub shard_value: i32,
    #[serde(default)]
    pub bk_biz_id: i64,
    #[serde(default)]
    pub bk_cloud_id: i64,
    pub backup_host: String,
    pub backup_port: u16,
    pub mysql_role: MysqlRole,
    #[serde(default)]
    pub mysql_version: String,
    #[serde(default)]
    pub storage_engine: String,
    pub backup_type: BackupType,
    pub data_schema_grant: DataSchemaGrant,
    #[serde(default)]
    pub is_full_backup: bool,
    #[serde(default)]
    pub backup_tool: String,
    #[serde(default)]
    pub backup_charset: String,
    #[serde(default)]
    pub sql_mode: String,
    #[serde(default)]
    pub binlog_format: String,
    #[serde(default)]
    pub binlog_row_image: String,
    #[serde(default)]
    pub time_zone: String,
    #[serde(default)]
    pub backup_begin_time: String,
    #[serde(default)]
    pub backup_end_time: String,
    #[serde(default)]
    pub backup_consistent_time: String,
    #[serde(default)]
    pub binlog_info: BinlogInfo,
    #[serde(default)]
    pub encrypt_enable: bool,
    #[serde(default)]
    pub file_retention_tag: String,
    /// Directory holding the artifacts; differs from the local one for remote backups.
    #[serde(default)]
    pub backup_dir: String,
    #[serde(default)]
    pub target_name: String,
    #[serde(default)]
    pub file_list: Vec<TarFileItem>,
    #[serde(default)]
    pub total_filesize: u64,
    #[serde(default)]
    pub total_size_kb_uncompress: i64,
    /// Keys written by newer releases survive a read-modify-write cycle.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_shard() -> i32 {
    -1
}

/// Full backup means a logical dump carrying data, schema and grants.
pub fn judge_is_full_backup(backup_type: BackupType, dsg: &DataSchemaGrant) -> bool {
    backup_type == BackupType::Logical && dsg.is_all()
}

impl IndexContent {
    pub fn new(
        backup_id: String,
        backup_host: String,
        backup_port: u16,
        mysql_role: MysqlRole,
        backup_type: BackupType,
        data_schema_grant: DataSchemaGrant,
    ) -> IndexContent {
        IndexContent {
            backup_id,
            bill_id: String::new(),
            cluster_id: 0,
            cluster_address: String::new(),
            shard_value: -1,
            bk_biz_id: 0,
            bk_cloud_id: 0,
            backup_host,
            backup_port,
            mysql_role,
            mysql_version: String::new(),
            storage_engine: String::new(),
            is_full_backup: judge_is_full_backup(backup_type, &data_schema_grant),
            backup_type,
            data_schema_grant,
            backup_tool: String::new(),
            backup_charset: String::new(),
            sql_mode: String::new(),
            binlog_format: String::new(),
            binlog_row_image: String::new(),
            time_zone: String::new(),
            backup_begin_time: String::new(),
            backup_end_time: String::new(),
            backup_consistent_time: String::new(),
            binlog_info: BinlogInfo::default(),
            encrypt_enable: false,
            file_retention_tag: String::new(),
            backup_dir: String::new(),
            target_name: String::new(),
            file_list: Vec::new(),
            total_filesize: 0,
            total_size_kb_uncompress: -1,
            extra: Map::new(),
        }
    }

    pub fn refresh_full_backup_flag(&mut self) {
        self.is_full_backup = judge_is_full_backup(self.backup_type, &self.data_schema_grant);
    }

    pub fn index_file_name(&self) -> String {
        format!("{}.index", self.target_name)
    }

    pub fn add_file(&mut self, item: TarFileItem) {
        self.total_filesize += item.file_size;
        self.file_list.push(item);
    }

    pub fn recompute_total_filesize(&mut self) {
        self.total_filesize = self.file_list.iter().map(|f| f.file_size).sum();
    }

    pub fn from_json(text: &str) -> Result<IndexContent> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<IndexContent> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BackupError::integrity(format!("read index {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Atomically writes the index (temp file in the same directory, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(self.to_json()?.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| BackupError::Io(e.error))?;
        Ok(())
    }

    /// Every listed file must exist next to the index with its recorded size.
    /// Only a `.priv` file may be empty: an instance without exportable accounts yields one.
    pub fn verify_files(&self, dir: &Path) -> Result<()> {
        for item in &self.file_list {
            let path = dir.join(&item.file_name);
            let size = std::fs::metadata(&path)
                .map_err(|_| BackupError::integrity(format!("file {} not found", path.display())))?
                .len();
            if size != item.file_size || (size == 0 && item.file_type != FileType::Priv) {
                return Err(BackupError::integrity(format!(
                    "file {} size mismatch: expect {} got {}",
                    path.display(),
                    item.file_size,
                    size
                )));
            }
        }
        let sum: u64 = self.file_list.iter().map(|f| f.file_size).sum();
        if sum != self.total_filesize {
            return Err(BackupError::integrity(format!(
                "total_filesize {} does not match file list sum {}",
                self.total_filesize, sum
            )));
        }
        Ok(())
    }

    pub fn artifact_dir(&self, index_path: &Path) -> PathBuf {
        index_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> IndexContent {
        let mut index = IndexContent::new(
            "0190b3a4-7d2e-7a3c-9f00-000000000001".to_string(),
            "127.0.0.1".to_string(),
            3306,
            MysqlRole::Slave,
            BackupType::Logical,
            DataSchemaGrant::ALL,
        );
        index.target_name = "app.db_-1_127.0.0.1_3306_20240102-030405_logical".to_string();
        index.binlog_info.show_master_status = BinlogStatus {
            binlog_file: "binlog20000.000012".to_string(),
            binlog_pos: "4528".to_string(),
            master_host: "127.0.0.1".to_string(),
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
    fn test_full_backup_judgement() {
        assert!(judge_is_full_backup(BackupType::Logical, &DataSchemaGrant::ALL));
        assert!(!judge_is_full_backup(BackupType::Physical, &DataSchemaGrant::ALL));
        let grant_only: DataSchemaGrant = "grant".parse().unwrap();
        assert!(!judge_is_full_backup(BackupType::Logical, &grant_only));
        assert!(sample().is_full_backup);
    }

    #[test]
    fn test_json_round_trip_keeps_unknown_keys() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["uploader_task_id"] = Value::from(42);
        let text = serde_json::to_string(&value).unwrap();

        let parsed = IndexContent::from_json(&text).unwrap();
        assert_eq!(parsed.extra.get("uploader_task_id"), Some(&Value::from(42)));
        let again: Value = serde_json::from_str(&parsed.to_json().unwrap()).unwrap();
        assert_eq!(again, value);
    }

    #[test]
    fn test_save_and_verify() {
        let dir = TempDir::new().unwrap();
        let mut index = sample();
        std::fs::write(dir.path().join("a_0.tar"), vec![1u8; 10]).unwrap();
        std::fs::write(dir.path().join("a_1.tar"), vec![1u8; 5]).unwrap();
        for (name, size) in [("a_0.tar", 10), ("a_1.tar", 5)] {
            index.add_file(TarFileItem {
                file_name: name.to_string(),
                file_size: size,
                file_type: FileType::Tar,
                contain_files: vec![],
            });
        }
        assert_eq!(index.total_filesize, 15);
        index.verify_files(dir.path()).unwrap();

        let path = dir.path().join(index.index_file_name());
        index.save(&path).unwrap();
        assert_eq!(IndexContent::load(&path).unwrap(), index);

        std::fs::write(dir.path().join("a_1.tar"), vec![1u8; 6]).unwrap();
        assert!(matches!(index.verify_files(dir.path()), Err(BackupError::Integrity(_))));
    }

    #[test]
    fn test_only_priv_may_be_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.priv"), b"").unwrap();
        std::fs::write(dir.path().join("a_0.tar"), b"").unwrap();
        let mut index = sample();
        index.add_file(TarFileItem {
            file_name: "a.priv".to_string(),
            file_size: 0,
            file_type: FileType::Priv,
            contain_files: vec![],
        });
        index.verify_files(dir.path()).unwrap();

        index.add_file(TarFileItem {
            file_name: "a_0.tar".to_string(),
            file_size: 0,
            file_type: FileType::Tar,
            contain_files: vec![],
        });
        assert!(matches!(index.verify_files(dir.path()), Err(BackupError::Integrity(_))));
    }

    #[test]
    fn test_slave_status_omitted_for_master() {
        let mut index = sample();
        index.binlog_info.show_slave_status = None;
        let value = serde_json::to_value(&index).unwrap();
        assert!(value["binlog_info"].get("show_slave_status").is_none());
        assert_eq!(value["data_schema_grant"], "all");
        assert_eq!(value["mysql_role"], "slave");
    }
}
