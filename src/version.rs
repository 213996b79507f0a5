use std::fmt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::error::{BackupError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MysqlFlavor {
    Official,
    TMySQL,
    TXSQL,
}

/// A parsed `SELECT VERSION()` string such as `5.7.20-tmysql-3.4.2-log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MysqlVersion {
    pub raw: String,
    /// `major * 1_000_000 + minor * 1_000 + patch`.
    pub number: u32,
    pub flavor: MysqlFlavor,
}

impl MysqlVersion {
    pub fn parse(raw: &str) -> Result<MysqlVersion> {
        let re = Regex::new(r"^(\d+)\.(\d+)\.(\d+)").expect("static regex");
        let caps = re
            .captures(raw.trim())
            .ok_or_else(|| BackupError::precheck(format!("unrecognized mysql version '{}'", raw)))?;
        let bad = || BackupError::precheck(format!("unrecognized mysql version '{}'", raw));
        let part = |i: usize| caps[i].parse::<u32>().map_err(|_| bad());
        let (major, minor, patch) = (part(1)?, part(2)?, part(3)?);
        if minor >= 1_000 || patch >= 1_000 {
            return Err(bad());
        }
        let number = major
            .checked_mul(1_000_000)
            .and_then(|n| n.checked_add(minor * 1_000 + patch))
            .ok_or_else(bad)?;

        let lower = raw.to_ascii_lowercase();
        let flavor = if lower.contains("tmysql") {
            MysqlFlavor::TMySQL
        } else if lower.contains("txsql") {
            MysqlFlavor::TXSQL
        } else {
            MysqlFlavor::Official
        };

        Ok(MysqlVersion {
            raw: raw.trim().to_string(),
            number,
            flavor,
        })
    }

    pub fn is_official(&self) -> bool {
        self.flavor == MysqlFlavor::Official
    }

    pub fn major_minor(&self) -> (u32, u32) {
        (self.number / 1_000_000, (self.number / 1_000) % 1_000)
    }

    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        self.number >= major * 1_000_000 + minor * 1_000 + patch
    }

    /// `SET PASSWORD ... = PASSWORD()` stops working at 5.7.6.
    pub fn uses_alter_user_password(&self) -> bool {
        self.at_least(5, 7, 6)
    }

    pub fn supports_show_create_user(&self) -> bool {
        self.at_least(5, 7, 6)
    }

    /// Pick the physical backup binary for this server.
    pub fn xtrabackup_tool(&self) -> Result<XtrabackupTool> {
        let tool = match self.major_minor() {
            (5, 1) => XtrabackupTool::Innobackupex51,
            (5, 5) => XtrabackupTool::Xtrabackup55,
            (5, 6) => XtrabackupTool::Xtrabackup56,
            (5, 7) => XtrabackupTool::Xtrabackup57,
            (8, 0) => XtrabackupTool::Xtrabackup80,
            (major, minor) => {
                return Err(BackupError::precheck(format!(
                    "no physical backup tool for mysql {}.{}",
                    major, minor
                )))
            }
        };
        Ok(tool)
    }
}

impl fmt::Display for MysqlVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XtrabackupTool {
    Innobackupex51,
    Xtrabackup55,
    Xtrabackup56,
    Xtrabackup57,
    Xtrabackup80,
}

impl XtrabackupTool {
    pub fn binary_name(&self) -> &'static str {
        match self {
            XtrabackupTool::Innobackupex51 => "innobackupex",
            XtrabackupTool::Xtrabackup55 => "xtrabackup_55",
            XtrabackupTool::Xtrabackup56 => "xtrabackup_56",
            XtrabackupTool::Xtrabackup57 => "xtrabackup_57",
            XtrabackupTool::Xtrabackup80 => "xtrabackup_80",
        }
    }

    /// Directory under `tool_dir` holding the flavor-specific builds.
    pub fn flavor_dir(flavor: MysqlFlavor) -> &'static str {
        match flavor {
            MysqlFlavor::Official => "xtrabackup/official",
            MysqlFlavor::TMySQL | MysqlFlavor::TXSQL => "xtrabackup/tmysql",
        }
    }

    /// innobackupex takes the target directory positionally.
    pub fn is_innobackupex(&self) -> bool {
        matches!(self, XtrabackupTool::Innobackupex51)
    }

    pub fn supports_binlog_info(&self) -> bool {
        matches!(self, XtrabackupTool::Xtrabackup57)
    }

    pub fn supports_lock_ddl(&self) -> bool {
        matches!(self, XtrabackupTool::Xtrabackup57 | XtrabackupTool::Xtrabackup80)
    }

    pub fn supports_ftwrl_wait(&self) -> bool {
        !self.is_innobackupex()
    }
}

/// Parse the first line of `ldd --version`, e.g. `ldd (GNU libc) 2.17`.
pub fn parse_glibc_version(output: &str) -> Result<(u32, u32)> {
    let re = Regex::new(r"(\d+)\.(\d+)\s*$").expect("static regex");
    let first = output.lines().next().unwrap_or_default();
    let caps = re
        .captures(first.trim())
        .ok_or_else(|| BackupError::precheck(format!("cannot parse glibc version from '{}'", first)))?;
    Ok((caps[1].parse().unwrap_or(0), caps[2].parse().unwrap_or(0)))
}
