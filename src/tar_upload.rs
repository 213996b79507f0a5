use std::path::{Path, PathBuf};
use std::time::Duration;
use log::info;
use tokio_util::sync::CancellationToken;
use crate::backup::publish;
use crate::config::BackupConfig;
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::IndexContent;
use crate::packager::Packager;
use crate::planner::resolve_backup_client;
use crate::service::mysql::metadata::read_physical_metadata;
use crate::service::mysql::xtrabackup::apply_physical_metadata;
use crate::service::service::{DumpTarget, PackStrategy};
use crate::utils::{find_tool, now_string};

/// How a dump directory left by `backup_tool` is packaged.
pub fn strategy_for_tool(backup_tool: &str) -> PackStrategy {
    match backup_tool {
        "mydumper" => PackStrategy::TarParts,
        "mysqldump" => PackStrategy::TarThenSplit,
        "mysql" => PackStrategy::None,
        _ => PackStrategy::SplitStream,
    }
}

/// Package the dump directory next to `index_path` and rewrite the index.
///
/// With `with_remote` the directory was filled by a stream receiver, so the
/// physical metadata sidecars are read here instead of on the dumping host.
pub async fn run_tar_upload(cnf: &BackupConfig, index_path: &Path, with_remote: bool, root: &CancellationToken) -> Result<PathBuf> {
    let ctx = TaskContext::new(root, Duration::from_millis(cnf.public.kill_delay_ms));
    let result = tar_upload(cnf, index_path, with_remote, &ctx).await;
    ctx.finish();
    result
}

async fn tar_upload(cnf: &BackupConfig, index_path: &Path, with_remote: bool, ctx: &TaskContext) -> Result<PathBuf> {
    let mut index = IndexContent::load(index_path)?;
    let dir = index.artifact_dir(index_path);
    let target = DumpTarget::new(dir.clone(), index.target_name.clone());
    let strategy = strategy_for_tool(&index.backup_tool);
    if strategy != PackStrategy::None && !target.dir().is_dir() {
        return Err(BackupError::integrity(format!(
            "dump directory {} not found",
            target.dir().display()
        )));
    }

    if with_remote {
        let qpress = find_tool(&cnf.public.tool_dir, "qpress").ok();
        let meta = read_physical_metadata(&target.dir(), index.mysql_role.is_replica(), qpress.as_deref(), ctx).await?;
        apply_physical_metadata(&mut index, meta);
    }

    Packager::new(cnf, target.clone())?.pack(strategy, &mut index, ctx).await?;
    index.backup_dir = dir.to_string_lossy().into_owned();
    if index.backup_end_time.is_empty() {
        index.backup_end_time = now_string();
    }
    index.refresh_full_backup_flag();
    ctx.check()?;
    index.verify_files(&dir)?;
    index.save(index_path)?;
    info!("tar-upload rewrote {}", index_path.display());

    let backup_client = resolve_backup_client(cnf.backup_client.enable, cnf.public.is_standby);
    publish(cnf, &index, index_path, backup_client, ctx).await;
    Ok(index_path.to_path_buf())
}
