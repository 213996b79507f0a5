use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use crate::config::BackupConfig;
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::{FileType, IndexContent, TarFileItem};
use crate::runner::MyExec;
use crate::utils::{find_tool, now_string};

pub const STATUS_EVENT: &str = "MysqlBackupStatusEvent";
const REPORT_RETRIES: u32 = 3;
const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Begin,
    Running,
    Tarball,
    Success,
    Failed,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupStatus::Begin => "Begin",
            BackupStatus::Running => "Running",
            BackupStatus::Tarball => "Tarball",
            BackupStatus::Success => "Success",
            BackupStatus::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Identity carried by every status event.
#[derive(Serialize, Debug, Clone, Default)]
pub struct ReportIdentity {
    pub backup_id: String,
    pub bill_id: String,
    pub bk_biz_id: i64,
    pub bk_cloud_id: i64,
    pub cluster_id: i64,
    pub cluster_address: String,
    pub shard_value: i32,
    pub backup_host: String,
    pub backup_port: u16,
    pub mysql_role: String,
    pub backup_type: String,
    pub target_name: String,
}

impl ReportIdentity {
    pub fn from_index(index: &IndexContent) -> ReportIdentity {
        ReportIdentity {
            backup_id: index.backup_id.clone(),
            bill_id: index.bill_id.clone(),
            bk_biz_id: index.bk_biz_id,
            bk_cloud_id: index.bk_cloud_id,
            cluster_id: index.cluster_id,
            cluster_address: index.cluster_address.clone(),
            shard_value: index.shard_value,
            backup_host: index.backup_host.clone(),
            backup_port: index.backup_port,
            mysql_role: index.mysql_role.to_string(),
            backup_type: index.backup_type.to_string(),
            target_name: index.target_name.clone(),
        }
    }

    /// Before planning only the configured identity is known.
    pub fn from_config(cnf: &BackupConfig) -> ReportIdentity {
        let p = &cnf.public;
        ReportIdentity {
            backup_id: p.backup_id.clone(),
            bill_id: p.bill_id.clone(),
            bk_biz_id: p.bk_biz_id,
            bk_cloud_id: p.bk_cloud_id,
            cluster_id: p.cluster_id,
            cluster_address: p.cluster_address.clone(),
            shard_value: p.shard_value,
            backup_host: p.host.clone(),
            backup_port: p.port,
            mysql_role: p.role.to_string(),
            backup_type: p.backup_type.to_string(),
            target_name: p.target_name.clone(),
        }
    }
}

pub fn status_event(status: BackupStatus, identity: &ReportIdentity, message: &str) -> Result<Value> {
    let mut event = serde_json::to_value(identity)?;
    if let Value::Object(map) = &mut event {
        map.insert("event_name".to_string(), Value::from(STATUS_EVENT));
        map.insert("status".to_string(), Value::from(status.to_string()));
        map.insert("report_time".to_string(), Value::from(now_string()));
        if !message.is_empty() {
            map.insert("message".to_string(), Value::from(message));
        }
    }
    Ok(event)
}

/// Publishes status transitions. Delivery is best effort.
pub struct Reporter {
    client: reqwest::Client,
    url: Option<String>,
    identity: ReportIdentity,
}

impl Reporter {
    pub fn new(cnf: &BackupConfig) -> Result<Reporter> {
        let client = reqwest::Client::builder().timeout(REPORT_TIMEOUT).build()?;
        let url = Some(cnf.public.sync_report_url.clone()).filter(|u| !u.is_empty());
        Ok(Reporter {
            client,
            url,
            identity: ReportIdentity::from_config(cnf),
        })
    }

    pub fn set_identity(&mut self, identity: ReportIdentity) {
        self.identity = identity;
    }

    async fn post(&self, url: &str, event: &Value) -> Result<String> {
        let resp = self.client.post(url).json(event).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(BackupError::Transient(format!("report returned {}: {}", status, body)));
        }
        Ok(body)
    }

    /// Transient failures are logged, never returned.
    pub async fn report(&self, status: BackupStatus, message: &str) {
        let event = match status_event(status, &self.identity, message) {
            Ok(event) => event,
            Err(e) => {
                warn!("build status event: {}", e);
                return;
            }
        };
        info!("backup status {} for {}", status, self.identity.target_name);
        let Some(url) = &self.url else {
            debug!("no sync_report_url, event {}", event);
            return;
        };
        for attempt in 1..=REPORT_RETRIES {
            match self.post(url, &event).await {
                Ok(body) => {
                    debug!("report {} accepted: {}", status, body);
                    return;
                }
                Err(e) => {
                    warn!("report {} attempt {}/{}: {}", status, attempt, REPORT_RETRIES, e);
                    if attempt < REPORT_RETRIES {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }
        warn!("{}", BackupError::Transient(format!("give up reporting {}", status)));
    }
}

pub fn report_file(report_dir: &Path, port: u16) -> PathBuf {
    report_dir.join(format!("dbbackup_result_{}.log", port))
}

/// The finished backup as one JSON line; the index itself is appended to the file list.
pub fn report_row(index: &IndexContent, index_path: &Path, status: BackupStatus) -> Result<String> {
    let index_size = std::fs::metadata(index_path)?.len();
    let mut files = index.file_list.clone();
    files.push(TarFileItem {
        file_name: index_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| index.index_file_name()),
        file_size: index_size,
        file_type: FileType::Index,
        contain_files: Vec::new(),
    });
    let row = json!({
        "backup_id": index.backup_id,
        "bill_id": index.bill_id,
        "bk_biz_id": index.bk_biz_id,
        "bk_cloud_id": index.bk_cloud_id,
        "cluster_id": index.cluster_id,
        "cluster_address": index.cluster_address,
        "shard_value": index.shard_value,
        "backup_host": index.backup_host,
        "backup_port": index.backup_port,
        "mysql_role": index.mysql_role,
        "backup_type": index.backup_type,
        "data_schema_grant": index.data_schema_grant,
        "is_full_backup": index.is_full_backup,
        "backup_begin_time": index.backup_begin_time,
        "backup_end_time": index.backup_end_time,
        "backup_consistent_time": index.backup_consistent_time,
        "backup_dir": index.backup_dir,
        "file_retention_tag": index.file_retention_tag,
        "status": status.to_string(),
        "file_list": files,
    });
    Ok(serde_json::to_string(&row)?)
}

pub fn append_report_row(report_dir: &Path, port: u16, row: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(report_dir)?;
    let path = report_file(report_dir, port);
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{}", row)?;
    Ok(path)
}

/// Hands every artifact and the index to the upload agent. Failures are transient.
pub async fn upload_artifacts(cnf: &BackupConfig, index: &IndexContent, index_path: &Path, ctx: &TaskContext) {
    let client = match find_tool(&cnf.public.tool_dir, &cnf.backup_client.client_path) {
        Ok(client) => client,
        Err(e) => {
            warn!("{}", BackupError::Transient(format!("backup client: {}", e)));
            return;
        }
    };
    let dir = index.artifact_dir(index_path);
    let mut files: Vec<PathBuf> = index.file_list.iter().map(|f| dir.join(&f.file_name)).collect();
    files.push(index_path.to_path_buf());
    for file in files {
        let upload = MyExec::new("backup_client", &client)
            .arg("--tag")
            .arg(cnf.backup_client.file_tag.as_str())
            .arg("--storage-type")
            .arg(cnf.backup_client.storage_type.as_str())
            .arg("--file")
            .arg(file.to_string_lossy())
            .run(ctx)
            .await;
        match upload {
            Ok(_) => info!("handed {} to backup client", file.display()),
            Err(e) => warn!("{}", BackupError::Transient(format!("upload {}: {}", file.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupType, DataSchemaGrant, MysqlRole};
    use ini::Ini;
    use tempfile::TempDir;

    fn index() -> IndexContent {
        let mut index = IndexContent::new(
            "id-1".to_string(),
            "10.0.0.9".to_string(),
            3306,
            MysqlRole::Master,
            BackupType::Logical,
            DataSchemaGrant::ALL,
        );
        index.target_name = "t1".to_string();
        index.add_file(TarFileItem {
            file_name: "t1_0.tar".to_string(),
            file_size: 10,
            file_type: FileType::Tar,
            contain_files: Vec::new(),
        });
        index
    }

    #[test]
    fn test_status_event() {
        let identity = ReportIdentity::from_index(&index());
        let event = status_event(BackupStatus::Failed, &identity, "backup timeout exceed").unwrap();
        assert_eq!(event["event_name"], STATUS_EVENT);
        assert_eq!(event["status"], "Failed");
        assert_eq!(event["backup_port"], 3306);
        assert_eq!(event["message"], "backup timeout exceed");
    }

    #[test]
    fn test_report_row_appends_index() {
        let dir = TempDir::new().unwrap();
        let index = index();
        let index_path = dir.path().join("t1.index");
        index.save(&index_path).unwrap();

        let row = report_row(&index, &index_path, BackupStatus::Success).unwrap();
        let path = append_report_row(dir.path(), 3306, &row).unwrap();
        assert_eq!(path, dir.path().join("dbbackup_result_3306.log"));

        let text = std::fs::read_to_string(&path).unwrap();
        let value: Value = serde_json::from_str(text.trim_end()).unwrap();
        let files = value["file_list"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1]["file_type"], "index");
        assert_eq!(files[1]["file_name"], "t1.index");
        assert_eq!(value["status"], "Success");
    }

    #[tokio::test]
    async fn test_report_without_url_only_logs() {
        let cnf = BackupConfig::from_ini(&Ini::load_from_str("[Public]\nuser=u\n").unwrap()).unwrap();
        let reporter = Reporter::new(&cnf).unwrap();
        reporter.report(BackupStatus::Begin, "").await;
    }
}
