use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;
use crate::config::{BackupConfig, BackupType};
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::{FileType, IndexContent};
use crate::packager::Cipher;
use crate::service::mysql::binlog_pos::{change_master_sql, find_binlog_pos, ChangeMaster};
use crate::service::mysql::myloader::MyloaderLoader;
use crate::service::mysql::mysql_loader::{MysqlLoader, SqlScript};
use crate::service::mysql::mysql_service::MySQLService;
use crate::service::mysql::physical_loader::PhysicalLoader;
use crate::service::service::Loader;
use crate::unpackager::Unpackager;

/// `loadbackup` switches that are not part of the INI.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub change_master_host: Option<String>,
    pub change_master_port: Option<u16>,
    pub repl_user: Option<String>,
    pub repl_password: Option<String>,
    pub remove_original: bool,
}

impl RestoreOptions {
    fn change_master(&self) -> Result<Option<(&str, u16)>> {
        match (&self.change_master_host, self.change_master_port) {
            (Some(host), Some(port)) => Ok(Some((host.as_str(), port))),
            (None, None) => Ok(None),
            _ => Err(BackupError::config("--change-master-host and --change-master-port go together")),
        }
    }
}

/// The index named by `[LogicalLoad]`, else by `[PhysicalLoad]`.
pub fn index_file_path(cnf: &BackupConfig) -> Result<PathBuf> {
    let candidates = [&cnf.logical_load.index_file_path, &cnf.physical_load.index_file_path];
    candidates
        .into_iter()
        .find(|p| !p.as_os_str().is_empty())
        .cloned()
        .ok_or_else(|| BackupError::config("index_file_path is required in [LogicalLoad] or [PhysicalLoad]"))
}

pub fn staging_dir(cnf: &BackupConfig, backup_type: BackupType) -> PathBuf {
    match backup_type {
        BackupType::Physical => cnf.physical_load.mysql_load_dir.clone(),
        _ => cnf.logical_load.mysql_load_dir.clone(),
    }
}

/// The `.priv` artifact of a backup, next to its index.
pub fn priv_file(index: &IndexContent, index_path: &Path) -> Result<PathBuf> {
    let item = index
        .file_list
        .iter()
        .find(|f| f.file_type == FileType::Priv)
        .ok_or_else(|| BackupError::integrity(format!("{} lists no priv file", index_path.display())))?;
    Ok(index.artifact_dir(index_path).join(&item.file_name))
}

fn cipher_for(cnf: &BackupConfig, index: &IndexContent) -> Result<Option<Cipher>> {
    if !index.encrypt_enable {
        return Ok(None);
    }
    let mut encrypt = cnf.encrypt_opt.clone();
    encrypt.encrypt_enable = true;
    Cipher::from_config(&encrypt, &cnf.public.tool_dir)
}

async fn run_loader(loader: &mut dyn Loader, index: &IndexContent, ctx: &TaskContext) -> Result<()> {
    info!("restore with {}", loader.name());
    loader.init_config(index).await?;
    let result: Result<()> = async {
        loader.pre_load(ctx).await?;
        loader.load(ctx).await
    }
    .await;
    if let Err(e) = loader.post_load(ctx).await {
        warn!("{} post load: {}", loader.name(), e);
    }
    result
}

/// Restore the backup the config points at; returns the replication coordinates
/// when a change-master target was given.
pub async fn run_restore(cnf: &BackupConfig, opts: &RestoreOptions, root: &CancellationToken) -> Result<Option<ChangeMaster>> {
    cnf.validate_load()?;
    let mut ctx = TaskContext::new(root, Duration::from_millis(cnf.public.kill_delay_ms));
    ctx.remove_original = opts.remove_original;
    let result = restore(cnf, opts, &ctx).await;
    if let Err(e) = &result {
        error!("restore to port {} failed: {}", cnf.public.port, e);
    }
    ctx.finish();
    result
}

async fn restore(cnf: &BackupConfig, opts: &RestoreOptions, ctx: &TaskContext) -> Result<Option<ChangeMaster>> {
    let change_master = opts.change_master()?;
    let index_path = index_file_path(cnf)?;
    let index = IndexContent::load(&index_path)?;
    // Refuse before the target is touched.
    let coordinates = match change_master {
        Some((host, port)) => Some(find_binlog_pos(&index, host, port)?),
        None => None,
    };

    if index.data_schema_grant.is_grant_only() {
        let script = priv_file(&index, &index_path)?;
        let db = MySQLService::connect(&cnf.public).await?;
        let mut loader = MysqlLoader::new(cnf, db.clone(), &script, SqlScript::Privileges);
        let result = run_loader(&mut loader, &index, ctx).await;
        db.close().await;
        result?;
        return Ok(coordinates);
    }

    let staging = staging_dir(cnf, index.backup_type);
    tokio::fs::create_dir_all(&staging).await?;
    let (index, dir) = Unpackager::new(&index_path, &staging, &cnf.public.tool_dir)
        .with_cipher(cipher_for(cnf, &index)?)
        .unpack(ctx)
        .await?;
    info!("unpacked {} into {}", index_path.display(), dir.display());

    match index.backup_tool.as_str() {
        "mydumper" => {
            let db = MySQLService::connect(&cnf.public).await?;
            let mut loader = MyloaderLoader::new(cnf, db.clone(), &dir);
            let result = run_loader(&mut loader, &index, ctx).await;
            db.close().await;
            result?;
        }
        "mysqldump" => {
            let db = MySQLService::connect(&cnf.public).await?;
            let script = dir.join(format!("{}.sql", index.target_name));
            let mut loader = MysqlLoader::new(cnf, db.clone(), &script, SqlScript::Dump);
            let result = run_loader(&mut loader, &index, ctx).await;
            db.close().await;
            result?;
        }
        "xtrabackup" | "myrocks_hotbackup" | "tokudb_backup" => {
            let mut loader = PhysicalLoader::new(cnf, &dir);
            run_loader(&mut loader, &index, ctx).await?;
        }
        other => {
            return Err(BackupError::precheck(format!("no loader for backup tool '{}'", other)));
        }
    }

    if let (Some(pos), Some(user)) = (&coordinates, &opts.repl_user) {
        let password = opts.repl_password.clone().unwrap_or_default();
        let db = MySQLService::connect(&cnf.public).await?;
        let applied = db.exec(&change_master_sql(pos, user, &password)?).await;
        db.close().await;
        applied?;
        info!("replication set to {}:{} at {}:{}", pos.master_host, pos.master_port, pos.binlog_file, pos.binlog_pos);
    }
    Ok(coordinates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataSchemaGrant, MysqlRole};
    use crate::index::{BinlogStatus, TarFileItem};
    use ini::Ini;
    use tempfile::TempDir;

    fn config(text: &str) -> BackupConfig {
        BackupConfig::from_ini(&Ini::load_from_str(text).unwrap()).unwrap()
    }

    #[test]
    fn test_index_file_path_precedence() {
        let cnf = config("[LogicalLoad]\nindex_file_path=/a/l.index\n[PhysicalLoad]\nindex_file_path=/a/p.index\n");
        assert_eq!(index_file_path(&cnf).unwrap(), PathBuf::from("/a/l.index"));
        let cnf = config("[PhysicalLoad]\nindex_file_path=/a/p.index\n");
        assert_eq!(index_file_path(&cnf).unwrap(), PathBuf::from("/a/p.index"));
        assert!(matches!(index_file_path(&config("")).unwrap_err(), BackupError::Config(_)));
    }

    #[test]
    fn test_priv_file() {
        let mut index = IndexContent::new(
            "id".to_string(),
            "127.0.0.1".to_string(),
            3306,
            MysqlRole::Master,
            BackupType::Logical,
            "grant".parse().unwrap(),
        );
        index.add_file(TarFileItem {
            file_name: "t1.priv".to_string(),
            file_size: 10,
            file_type: FileType::Priv,
            contain_files: Vec::new(),
        });
        let path = priv_file(&index, Path::new("/data/dbbak/t1.index")).unwrap();
        assert_eq!(path, PathBuf::from("/data/dbbak/t1.priv"));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_refused_before_load() {
        let dir = TempDir::new().unwrap();
        let mut index = IndexContent::new(
            "id".to_string(),
            "10.0.0.9".to_string(),
            3306,
            MysqlRole::Slave,
            BackupType::Physical,
            DataSchemaGrant::ALL,
        );
        index.binlog_info.show_slave_status = Some(BinlogStatus {
            binlog_file: "binlog.000377".to_string(),
            binlog_pos: "120".to_string(),
            master_host: "10.0.0.1".to_string(),
            master_port: 3306,
            ..Default::default()
        });
        let index_path = dir.path().join("t.index");
        index.save(&index_path).unwrap();

        let cnf = config(&format!("[PhysicalLoad]\nindex_file_path={}\n", index_path.display()));
        let opts = RestoreOptions {
            change_master_host: Some("10.0.0.2".to_string()),
            change_master_port: Some(3306),
            ..Default::default()
        };
        let err = run_restore(&cnf, &opts, &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("cannot find binlog pos for current master 10.0.0.2:3306"));
    }

    #[tokio::test]
    async fn test_half_change_master_target_rejected() {
        let cnf = config("[PhysicalLoad]\nindex_file_path=/nonexistent.index\n");
        let opts = RestoreOptions {
            change_master_host: Some("10.0.0.2".to_string()),
            ..Default::default()
        };
        let err = run_restore(&cnf, &opts, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }
}
