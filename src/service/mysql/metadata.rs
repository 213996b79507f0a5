//! Parsers for the residue dump tools leave next to their data: mydumper's
//! `metadata` file and the `xtrabackup_*` sidecar files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use log::{debug, warn};
use regex::Regex;
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::index::BinlogStatus;
use crate::runner::MyExec;

pub const XTRABACKUP_INFO: &str = "xtrabackup_info";
pub const XTRABACKUP_BINLOG_INFO: &str = "xtrabackup_binlog_info";
pub const XTRABACKUP_SLAVE_INFO: &str = "xtrabackup_slave_info";
pub const XTRABACKUP_TIMESTAMP_INFO: &str = "xtrabackup_timestamp_info";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MydumperMetadata {
    pub started: String,
    pub finished: String,
    pub master: BinlogStatus,
    pub slave: Option<BinlogStatus>,
}

/// Parses mydumper `metadata`. Both the upstream (`Log`/`Pos`/`GTID`) and the
/// `SHOW ... STATUS` column style (`File`/`Position`/`Executed_Gtid_Set`) are accepted.
pub fn parse_mydumper_metadata(text: &str) -> Result<MydumperMetadata> {
    #[derive(PartialEq)]
    enum Block {
        None,
        Master,
        Slave,
    }

    let mut meta = MydumperMetadata::default();
    let mut slave = BinlogStatus::default();
    let mut in_slave = false;
    let mut block = Block::None;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(ts) = trimmed.strip_prefix("Started dump at:") {
            meta.started = ts.trim().to_string();
            block = Block::None;
            continue;
        }
        if let Some(ts) = trimmed.strip_prefix("Finished dump at:") {
            meta.finished = ts.trim().to_string();
            block = Block::None;
            continue;
        }
        if trimmed.starts_with("SHOW MASTER STATUS") || trimmed.starts_with("SHOW BINARY LOG STATUS") {
            block = Block::Master;
            continue;
        }
        if trimmed.starts_with("SHOW SLAVE STATUS") || trimmed.starts_with("SHOW REPLICA STATUS") {
            block = Block::Slave;
            in_slave = true;
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        let target = match block {
            Block::Master => &mut meta.master,
            Block::Slave => &mut slave,
            Block::None => continue,
        };
        match key.trim() {
            "Log" | "File" | "Relay_Master_Log_File" => target.binlog_file = value,
            "Pos" | "Position" | "Exec_Master_Log_Pos" => target.binlog_pos = value,
            "GTID" | "Executed_Gtid_Set" => target.gtid = value,
            "Host" | "Master_Host" => target.master_host = value,
            "Port" | "Master_Port" => target.master_port = value.parse().unwrap_or(0),
            other => debug!("ignore metadata key {}", other),
        }
    }

    if meta.started.is_empty() {
        return Err(BackupError::integrity("mydumper metadata has no 'Started dump at'"));
    }
    if in_slave && !slave.binlog_file.is_empty() {
        meta.slave = Some(slave);
    }
    Ok(meta)
}

/// `key = value` lines of `xtrabackup_info`.
pub fn parse_xtrabackup_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// `xtrabackup_binlog_info`: `file<TAB>pos[<TAB>gtid_set]`, gtid set may wrap lines.
pub fn parse_xtrabackup_binlog_info(text: &str) -> Result<BinlogStatus> {
    let mut fields = text.split_whitespace();
    let file = fields
        .next()
        .ok_or_else(|| BackupError::integrity("xtrabackup_binlog_info is empty"))?;
    let pos = fields
        .next()
        .ok_or_else(|| BackupError::integrity("xtrabackup_binlog_info has no position"))?;
    let gtid: String = fields.collect::<Vec<_>>().join("");
    Ok(BinlogStatus {
        binlog_file: file.to_string(),
        binlog_pos: pos.to_string(),
        gtid,
        ..Default::default()
    })
}

/// `xtrabackup_slave_info`, either
/// `CHANGE MASTER TO MASTER_LOG_FILE='f', MASTER_LOG_POS=p` or
/// `SET GLOBAL gtid_purged='...'; CHANGE MASTER TO MASTER_AUTO_POSITION=1`.
pub fn parse_xtrabackup_slave_info(text: &str) -> Result<BinlogStatus> {
    let file_re = Regex::new(r"(?i)MASTER_LOG_FILE\s*=\s*'([^']+)'").expect("static regex");
    let pos_re = Regex::new(r"(?i)MASTER_LOG_POS\s*=\s*(\d+)").expect("static regex");
    let gtid_re = Regex::new(r"(?is)gtid_purged\s*=\s*'([^']*)'").expect("static regex");

    let mut status = BinlogStatus::default();
    if let Some(c) = file_re.captures(text) {
        status.binlog_file = c[1].to_string();
    }
    if let Some(c) = pos_re.captures(text) {
        status.binlog_pos = c[1].to_string();
    }
    if let Some(c) = gtid_re.captures(text) {
        status.gtid = c[1].split_whitespace().collect();
    }
    if status.binlog_file.is_empty() && status.gtid.is_empty() {
        return Err(BackupError::integrity("xtrabackup_slave_info has neither binlog file nor gtid"));
    }
    Ok(status)
}

/// The consistent point recorded by the TXSQL/TMySQL toolchain; first datetime in the file.
pub fn parse_timestamp_info(text: &str) -> Option<String> {
    let re = Regex::new(r"\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}").expect("static regex");
    let consistent = text
        .lines()
        .find(|l| l.to_ascii_lowercase().contains("consistent"))
        .and_then(|l| re.find(l));
    consistent
        .or_else(|| re.find(text))
        .map(|m| m.as_str().replace('T', " "))
}

/// Read a sidecar, decompressing `<name>.qp` with qpress when only that exists.
pub async fn read_sidecar(dir: &Path, name: &str, qpress: Option<&Path>, ctx: &TaskContext) -> Result<Option<String>> {
    let plain = dir.join(name);
    if !plain.exists() {
        let compressed = PathBuf::from(format!("{}.qp", plain.display()));
        if !compressed.exists() {
            return Ok(None);
        }
        let Some(qpress) = qpress else {
            warn!("{} is compressed but qpress is unavailable", compressed.display());
            return Ok(None);
        };
        MyExec::new("qpress", qpress)
            .arg("-do")
            .arg(compressed.to_string_lossy())
            .stdout(crate::runner::Sink::File(plain.clone()))
            .run(ctx)
            .await?;
    }
    Ok(Some(tokio::fs::read_to_string(&plain).await?))
}

#[derive(Debug, Default, Clone)]
pub struct PhysicalMetadata {
    pub begin_time: String,
    pub end_time: String,
    pub consistent_time: String,
    pub master: BinlogStatus,
    pub slave: Option<BinlogStatus>,
    pub tool_version: String,
}

/// Collect binlog coordinates and timing from a physical backup directory.
pub async fn read_physical_metadata(
    dir: &Path,
    want_slave: bool,
    qpress: Option<&Path>,
    ctx: &TaskContext,
) -> Result<PhysicalMetadata> {
    let mut meta = PhysicalMetadata::default();

    if let Some(text) = read_sidecar(dir, XTRABACKUP_INFO, qpress, ctx).await? {
        let info = parse_xtrabackup_info(&text);
        meta.begin_time = info.get("start_time").cloned().unwrap_or_default();
        meta.end_time = info.get("end_time").cloned().unwrap_or_default();
        meta.tool_version = info.get("tool_version").cloned().unwrap_or_default();
    }

    let binlog = read_sidecar(dir, XTRABACKUP_BINLOG_INFO, qpress, ctx)
        .await?
        .ok_or_else(|| BackupError::integrity(format!("{} not found in {}", XTRABACKUP_BINLOG_INFO, dir.display())))?;
    meta.master = parse_xtrabackup_binlog_info(&binlog)?;

    if want_slave {
        match read_sidecar(dir, XTRABACKUP_SLAVE_INFO, qpress, ctx).await? {
            Some(text) => meta.slave = Some(parse_xtrabackup_slave_info(&text)?),
            None => {
                return Err(BackupError::integrity(format!(
                    "{} not found in {}",
                    XTRABACKUP_SLAVE_INFO,
                    dir.display()
                )))
            }
        }
    }

    meta.consistent_time = match read_sidecar(dir, XTRABACKUP_TIMESTAMP_INFO, qpress, ctx).await? {
        Some(text) => parse_timestamp_info(&text).unwrap_or_else(|| meta.end_time.clone()),
        None => meta.end_time.clone(),
    };
    Ok(meta)
}
