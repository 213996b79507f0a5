use std::path::{Path, PathBuf};
use std::time::Duration;
use chrono::Local;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;
use crate::config::BackupConfig;
use crate::context::{backup_timeout, TaskContext};
use crate::error::{BackupError, Result};
use crate::index::{FileType, IndexContent, TarFileItem};
use crate::packager::Packager;
use crate::planner::{plan, Plan};
use crate::remote::RemoteSession;
use crate::report::{append_report_row, report_row, upload_artifacts, BackupStatus, ReportIdentity, Reporter};
use crate::service::mysql::grant::export_privileges;
use crate::service::mysql::mysql_service::MySQLService;
use crate::utils::{cleanup_orphans, now_string};

pub fn priv_item(path: &Path) -> Result<TarFileItem> {
    let file_size = std::fs::metadata(path)?.len();
    Ok(TarFileItem {
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        file_size,
        file_type: FileType::Priv,
        contain_files: Vec::new(),
    })
}

/// Write the report row and hand the artifacts over. Neither fails the backup.
pub async fn publish(cnf: &BackupConfig, index: &IndexContent, index_path: &Path, backup_client: bool, ctx: &TaskContext) {
    match report_row(index, index_path, BackupStatus::Success)
        .and_then(|row| append_report_row(&cnf.public.report_dir, cnf.public.port, &row))
    {
        Ok(path) => info!("report row appended to {}", path.display()),
        Err(e) => warn!("{}", BackupError::Transient(format!("write report row: {}", e))),
    }
    if backup_client {
        upload_artifacts(cnf, index, index_path, ctx).await;
    }
}

/// One backup of the instance `cnf` points at. Returns the committed index path.
pub async fn run_backup(cnf: &BackupConfig, root: &CancellationToken) -> Result<PathBuf> {
    cnf.validate_backup()?;
    let timeout = backup_timeout(&cnf.public.backup_timeout, Local::now())?;
    let ctx = TaskContext::new(root, Duration::from_millis(cnf.public.kill_delay_ms)).with_timeout(timeout);
    info!("backup of port {} must finish within {:?}", cnf.public.port, timeout);

    let mut reporter = Reporter::new(cnf)?;
    let result = backup(cnf, &mut reporter, &ctx).await;
    if let Err(e) = &result {
        error!("backup of port {} failed: {}", cnf.public.port, e);
        reporter.report(BackupStatus::Failed, &e.to_string()).await;
    }
    ctx.finish();
    result
}

async fn backup(cnf: &BackupConfig, reporter: &mut Reporter, ctx: &TaskContext) -> Result<PathBuf> {
    tokio::fs::create_dir_all(&cnf.public.backup_dir).await?;
    let removed = cleanup_orphans(&cnf.public.backup_dir, cnf.public.port, cnf.io_limit_bytes())?;
    if !removed.is_empty() {
        info!("removed {} orphan directories", removed.len());
    }

    let db = MySQLService::connect(&cnf.public).await?;
    reporter.report(BackupStatus::Begin, "").await;
    let result = match plan(cnf, &db, ctx).await {
        Ok(plan) => {
            reporter.set_identity(ReportIdentity::from_index(&plan.index));
            dump(plan, &db, reporter, ctx).await
        }
        Err(e) => Err(e),
    };
    db.close().await;
    result
}

async fn dump(plan: Plan, db: &MySQLService, reporter: &Reporter, ctx: &TaskContext) -> Result<PathBuf> {
    let Plan {
        cnf,
        facts,
        target,
        mut index,
        mut dumper,
        backup_client,
    } = plan;
    dumper.init_config(&facts.version, !facts.log_bin_enabled).await?;

    let mut session = None;
    let mut receiver = None;
    if cnf.backup_to_remote.enable {
        let remote = RemoteSession::new(&cnf);
        remote.prepare(&cnf, ctx).await?;
        let listening = remote.start_receiver(&target.target_name, ctx).await?;
        if let Err(e) = dumper.set_stream_target(remote.host(), listening.port) {
            listening.abort();
            return Err(e);
        }
        session = Some(remote);
        receiver = Some(listening);
    }

    reporter.report(BackupStatus::Running, "").await;
    if let Err(e) = dumper.execute(ctx).await {
        if let Some(receiver) = receiver {
            receiver.abort();
        }
        return Err(e);
    }
    if let Some(receiver) = receiver {
        receiver.wait().await?;
    }
    dumper.finalize_metadata(&cnf, &mut index, ctx).await?;
    ctx.check()?;

    let dsg = cnf.public.data_schema_grant;
    let priv_path = target.priv_path();
    if dsg.grant {
        if !dsg.is_grant_only() {
            let size = export_privileges(db, &facts.version, &priv_path).await?;
            info!("exported {} bytes of privileges to {}", size, priv_path.display());
        }
        index.add_file(priv_item(&priv_path)?);
    }

    reporter.report(BackupStatus::Tarball, "").await;
    if session.is_none() {
        Packager::new(&cnf, target.clone())?
            .pack(dumper.pack_strategy(), &mut index, ctx)
            .await?;
    }
    if index.backup_end_time.is_empty() {
        index.backup_end_time = now_string();
    }
    if index.backup_consistent_time.is_empty() {
        index.backup_consistent_time = index.backup_end_time.clone();
    }
    index.refresh_full_backup_flag();
    ctx.check()?;

    let index_path = target.index_path();
    match session {
        Some(session) => {
            index.save(&index_path)?;
            let side_files: Vec<PathBuf> = if dsg.grant { vec![priv_path] } else { Vec::new() };
            if let Err(e) = session.finish(&index_path, &side_files, ctx).await {
                if let Err(rm) = std::fs::remove_file(&index_path) {
                    warn!("remove uncommitted index {}: {}", index_path.display(), rm);
                }
                return Err(e);
            }
            let remote_index = IndexContent::load(&index_path)?;
            info!(
                "remote backup on {}:{} holds {} files",
                session.host(),
                session.save_dir().display(),
                remote_index.file_list.len()
            );
            publish(&cnf, &remote_index, &index_path, false, ctx).await;
        }
        None => {
            index.verify_files(&target.backup_dir)?;
            index.save(&index_path)?;
            publish(&cnf, &index, &index_path, backup_client, ctx).await;
        }
    }
    reporter.report(BackupStatus::Success, "").await;
    info!("backup committed: {}", index_path.display());
    Ok(index_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ini::Ini;
    use tempfile::TempDir;

    #[test]
    fn test_priv_item() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t1.priv");
        std::fs::write(&path, b"GRANT USAGE ON *.* TO 'a'@'%';\n").unwrap();
        let item = priv_item(&path).unwrap();
        assert_eq!(item.file_name, "t1.priv");
        assert_eq!(item.file_type, FileType::Priv);
        assert_eq!(item.file_size, 31);
    }

    #[test]
    fn test_empty_priv_commits() {
        // Only private accounts on the instance: nothing to export.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t1.priv");
        std::fs::write(&path, crate::service::mysql::grant::render_priv(&[])).unwrap();
        let mut index = IndexContent::new(
            "id".to_string(),
            "127.0.0.1".to_string(),
            3306,
            crate::config::MysqlRole::Master,
            crate::config::BackupType::Logical,
            "grant".parse().unwrap(),
        );
        index.add_file(priv_item(&path).unwrap());
        assert_eq!(index.file_list[0].file_size, 0);
        index.verify_files(dir.path()).unwrap();
    }

    #[tokio::test]
    async fn test_too_short_timeout_fails_before_connecting() {
        let text = format!(
            "[Public]\nuser=u\nbackup_timeout={}\n",
            (Local::now() + chrono::Duration::seconds(5)).format("%H:%M:%S")
        );
        let cnf = BackupConfig::from_ini(&Ini::load_from_str(&text).unwrap()).unwrap();
        let err = run_backup(&cnf, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BackupError::Precheck(_)));
        assert!(err.to_string().contains("too short timeout"));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_first() {
        let cnf = BackupConfig::from_ini(&Ini::load_from_str("[Public]\nport=3306\n").unwrap()).unwrap();
        let err = run_backup(&cnf, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[tokio::test]
    async fn test_publish_writes_report_row() {
        let dir = TempDir::new().unwrap();
        let text = format!("[Public]\nuser=u\nreport_dir={}\n", dir.path().display());
        let cnf = BackupConfig::from_ini(&Ini::load_from_str(&text).unwrap()).unwrap();
        let mut index = IndexContent::new(
            "id".to_string(),
            "127.0.0.1".to_string(),
            3306,
            crate::config::MysqlRole::Master,
            crate::config::BackupType::Logical,
            "grant".parse().unwrap(),
        );
        index.target_name = "t1".to_string();
        let index_path = dir.path().join("t1.index");
        index.save(&index_path).unwrap();

        let ctx = TaskContext::new(&CancellationToken::new(), Duration::from_millis(100));
        publish(&cnf, &index, &index_path, false, &ctx).await;
        let row = std::fs::read_to_string(dir.path().join("dbbackup_result_3306.log")).unwrap();
        assert!(row.contains("\"file_type\":\"index\""));
    }
}
