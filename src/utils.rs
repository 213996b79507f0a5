use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use chrono::{DateTime, Datelike, Local};
use log::{debug, info, warn};
use which::which;
use crate::error::{BackupError, Result};
use crate::index::TIME_FORMAT;
use crate::throttle::remove_dir_limited;

pub fn get_size<P: AsRef<Path>>(path: P) -> Result<u64> {
    let path = path.as_ref();
    let metadata = fs::symlink_metadata(path)?;

    if metadata.is_file() {
        Ok(metadata.len())
    } else if metadata.is_dir() {
        let mut total_size = 0;
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            total_size += get_size(entry.path())?;
        }
        Ok(total_size)
    } else {
        Ok(0)
    }
}

pub fn now_string() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

/// `<cluster_address>_<shard>_<host>_<port>_<yyyymmdd-HHMMSS>_<type>`
pub fn target_name(
    cluster_address: &str,
    shard_value: i32,
    host: &str,
    port: u16,
    at: DateTime<Local>,
    backup_type: &str,
) -> String {
    format!(
        "{}_{}_{}_{}_{}_{}",
        cluster_address,
        shard_value,
        host,
        port,
        at.format("%Y%m%d-%H%M%S"),
        backup_type
    )
}

/// `<log_dir>/<tool>_<port>_<weekday>.log`, truncated when last written more than a day ago.
pub fn weekday_log_file(log_dir: &Path, tool: &str, port: u16) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)?;
    let weekday = Local::now().weekday().num_days_from_sunday();
    let path = log_dir.join(format!("{}_{}_{}.log", tool, port, weekday));
    if let Ok(meta) = fs::metadata(&path) {
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default();
        if age > Duration::from_secs(24 * 3600) {
            debug!("truncating stale log {}", path.display());
            fs::File::create(&path)?;
        }
    }
    Ok(path)
}

/// Locate a tool binary: `tool_dir/<name>` first, then `$PATH`.
pub fn find_tool(tool_dir: &Path, name: &str) -> Result<PathBuf> {
    let candidate = tool_dir.join(name);
    if candidate.is_file() {
        return Ok(candidate);
    }
    which(name).map_err(|_| BackupError::precheck(format!("tool {} not found in {} or PATH", name, tool_dir.display())))
}

/// MySQL client tools take the password as `-p<secret>`.
fn takes_short_password(program: &Path) -> bool {
    let name = program.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    name.starts_with("mysql") || name == "mydumper" || name == "myloader"
}

/// Hide secrets in an argv before it is logged.
pub fn mask_args(program: &Path, args: &[String]) -> String {
    let short_password = takes_short_password(program);
    let mut masked = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            masked.push("xxx".to_string());
            hide_next = false;
            continue;
        }
        let lower = arg.to_ascii_lowercase();
        if let Some((key, _)) = arg.split_once('=') {
            if lower.contains("password") || lower.contains("passwd") {
                masked.push(format!("{}=xxx", key));
                continue;
            }
        }
        if short_password && arg.starts_with("-p") {
            if arg.len() > 2 {
                masked.push("-pxxx".to_string());
                continue;
            }
            hide_next = true;
        }
        if lower == "--password" || lower == "--encrypt-key" {
            hide_next = true;
        }
        masked.push(arg.clone());
    }
    masked.join(" ")
}

/// Split an `extra_opt` string into argv items.
pub fn split_extra_opt(extra: &str) -> Vec<String> {
    extra.split_whitespace().map(str::to_string).collect()
}

/// Bytes free for an unprivileged user on the filesystem holding `path`.
pub fn free_space(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| BackupError::precheck(format!("statvfs {}: {}", path.display(), e)))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Remove task directories left behind by a previous crashed run of the same port.
///
/// A candidate is a directory named like a target name for `port`, with no
/// sibling `.index`, older than one minute.
pub fn cleanup_orphans(backup_dir: &Path, port: u16, io_limit: u64) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let Ok(entries) = fs::read_dir(backup_dir) else {
        return Ok(removed);
    };
    let marker = format!("_{}_", port);
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if !path.is_dir() || !name.contains(&marker) {
            continue;
        }
        if !(name.ends_with("_logical") || name.ends_with("_physical")) {
            continue;
        }
        if backup_dir.join(format!("{}.index", name)).exists() {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default();
        if age < Duration::from_secs(60) {
            continue;
        }
        info!("removing orphan backup directory {}", path.display());
        match remove_dir_limited(&path, io_limit) {
            Ok(()) => removed.push(path),
            Err(e) => warn!("failed to remove orphan {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_get_size() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("db1")).unwrap();
        fs::write(dir.path().join("db1/t.ibd"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("ibdata1"), vec![0u8; 28]).unwrap();
        assert_eq!(get_size(dir.path()).unwrap(), 128);
    }

    #[test]
    fn test_target_name() {
        let at = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).earliest().unwrap();
        assert_eq!(
            target_name("app.db", -1, "127.0.0.1", 3306, at, "logical"),
            "app.db_-1_127.0.0.1_3306_20240102-030405_logical"
        );
    }

    #[test]
    fn test_mask_args() {
        let args: Vec<String> = ["--host=h", "--password=abc", "-pabc", "--user", "u", "--password", "abc"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            mask_args(Path::new("/usr/bin/mysql"), &args),
            "--host=h --password=xxx -pxxx --user u --password xxx"
        );

        let ssh: Vec<String> = ["-p", "22", "-p2222", "mysql@10.0.0.5"].iter().map(|s| s.to_string()).collect();
        assert_eq!(mask_args(Path::new("ssh"), &ssh), "-p 22 -p2222 mysql@10.0.0.5");
        let mysql: Vec<String> = ["-p", "secret"].iter().map(|s| s.to_string()).collect();
        assert_eq!(mask_args(Path::new("mysqladmin"), &mysql), "-p xxx");
    }

    #[test]
    fn test_weekday_log_file() {
        let dir = TempDir::new().unwrap();
        let path = weekday_log_file(&dir.path().join("logs"), "mydumper", 3306).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("mydumper_3306_"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn test_cleanup_orphans_keeps_indexed_and_foreign() {
        let dir = TempDir::new().unwrap();
        let fresh = dir.path().join("c_-1_h_3306_20240101-000000_logical");
        let indexed = dir.path().join("c_-1_h_3306_20240101-000001_physical");
        let other_port = dir.path().join("c_-1_h_3307_20240101-000000_logical");
        for d in [&fresh, &indexed, &other_port] {
            fs::create_dir(d).unwrap();
        }
        fs::write(dir.path().join("c_-1_h_3306_20240101-000001_physical.index"), "{}").unwrap();
        // everything is younger than a minute, nothing goes
        let removed = cleanup_orphans(dir.path(), 3306, 0).unwrap();
        assert!(removed.is_empty());
        assert!(fresh.exists() && indexed.exists() && other_port.exists());
    }
}
