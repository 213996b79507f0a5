use std::path::Path;
use ini::{Ini, Properties};
use log::{debug, warn};
use sqlx::mysql::MySqlConnectOptions;
use tempfile::NamedTempFile;
use crate::error::{BackupError, Result};

/// Keys of `backup-my.cnf` that must follow the data files onto the target.
pub const BACKUP_MY_CNF_KEYS: [&str; 8] = [
    "innodb_checksum_algorithm",
    "innodb_data_file_path",
    "innodb_log_checksum_algorithm",
    "innodb_log_file_size",
    "innodb_log_files_in_group",
    "innodb_page_size",
    "innodb_undo_tablespaces",
    "lower_case_table_names",
];

/// Never copied from the source, they identify the instance.
pub const BACKUP_MY_CNF_EXCLUDE: [&str; 2] = ["server_id", "server_uuid"];

pub trait MySqlDefaultsReader {
    fn from_defaults_file(defaults_file: &Path) -> Result<MySqlConnectOptions>;
}

impl MySqlDefaultsReader for MySqlConnectOptions {
    fn from_defaults_file(defaults_file: &Path) -> Result<MySqlConnectOptions> {
        let conf = Ini::load_from_file(defaults_file)?;
        let mut options = MySqlConnectOptions::new();
        if let Some(section) = conf.section(Some("client")) {
            if let Some(host) = section.get("host") {
                options = options.host(host);
            }
            if let Some(port) = section.get("port") {
                let port: u16 = port
                    .parse()
                    .map_err(|_| BackupError::config(format!("invalid port '{}' in {}", port, defaults_file.display())))?;
                options = options.port(port);
            }
            if let Some(user) = section.get("user") {
                options = options.username(user);
            }
            if let Some(password) = section.get("password") {
                options = options.password(password);
            }
            if let Some(socket) = section.get("socket") {
                options = options.socket(socket);
            }
        }
        Ok(options)
    }
}

/// A private `[client]` defaults file so passwords stay out of argv.
pub fn write_client_defaults(host: &str, port: u16, user: &str, password: &str) -> Result<NamedTempFile> {
    let mut conf = Ini::new();
    conf.with_section(Some("client"))
        .set("host", host)
        .set("port", port.to_string())
        .set("user", user)
        .set("password", password);
    let file = NamedTempFile::new()?;
    conf.write_to_file(file.path())?;
    Ok(file)
}

/// Split an `init_command` like `set names utf8mb4; set global foreign_key_checks=0`
/// into session and global variable assignments.
pub fn parse_init_command(init_command: &str) -> Result<(Vec<(String, String)>, Vec<(String, String)>)> {
    let mut session = Vec::new();
    let mut global = Vec::new();
    for stmt in init_command.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let lower = stmt.to_ascii_lowercase();
        let body = lower
            .strip_prefix("set ")
            .ok_or_else(|| BackupError::config(format!("init_command statement '{}' is not SET", stmt)))?
            .trim();
        if let Some(names) = body.strip_prefix("names ") {
            session.push(("names".to_string(), names.trim().to_string()));
            continue;
        }
        let (scope, assignment) = if let Some(rest) = body.strip_prefix("global ") {
            (true, rest)
        } else if let Some(rest) = body.strip_prefix("@@global.") {
            (true, rest)
        } else if let Some(rest) = body.strip_prefix("session ") {
            (false, rest)
        } else if let Some(rest) = body.strip_prefix("@@session.") {
            (false, rest)
        } else {
            (false, body)
        };
        let (name, value) = assignment
            .split_once('=')
            .ok_or_else(|| BackupError::config(format!("init_command statement '{}' has no value", stmt)))?;
        let pair = (name.trim().to_string(), value.trim().to_string());
        if scope {
            global.push(pair);
        } else {
            session.push(pair);
        }
    }
    Ok((session, global))
}

/// Defaults file handed to myloader, carrying the init_command variables.
pub fn write_myloader_defaults(init_command: &str) -> Result<NamedTempFile> {
    let (session, global) = parse_init_command(init_command)?;
    let mut conf = Ini::new();
    {
        let mut section = conf.with_section(Some("myloader_session_variables"));
        for (name, value) in &session {
            if name == "names" {
                continue;
            }
            section.set(name.as_str(), value.as_str());
        }
    }
    {
        let mut section = conf.with_section(Some("myloader_global_variables"));
        for (name, value) in &global {
            section.set(name.as_str(), value.as_str());
        }
    }
    let file = NamedTempFile::new()?;
    conf.write_to_file(file.path())?;
    debug!("myloader defaults: {} session, {} global variables", session.len(), global.len());
    Ok(file)
}

/// The `[mysqld]` section of a my.cnf (or `[mysqld<port>]` for multi-instance files).
pub fn mysqld_section(conf: &Ini, port: Option<u16>) -> Properties {
    if let Some(port) = port {
        if let Some(section) = conf.section(Some(format!("mysqld{}", port))) {
            return section.clone();
        }
    }
    conf.section(Some("mysqld")).cloned().unwrap_or_default()
}

/// Copy the storage-layout keys from the dump's `backup-my.cnf` into the target config.
pub fn merge_backup_my_cnf(backup_cnf: &Path, target_cnf: &Path, port: Option<u16>) -> Result<Vec<String>> {
    let backup = Ini::load_from_file(backup_cnf)?;
    let source = mysqld_section(&backup, None);
    let mut target = Ini::load_from_file(target_cnf)?;
    let section_name = match port {
        Some(p) if target.section(Some(format!("mysqld{}", p))).is_some() => format!("mysqld{}", p),
        _ => "mysqld".to_string(),
    };

    let mut changed = Vec::new();
    for key in BACKUP_MY_CNF_KEYS {
        if BACKUP_MY_CNF_EXCLUDE.contains(&key) {
            continue;
        }
        let Some(value) = source.get(key) else { continue };
        let current = target.section(Some(section_name.as_str())).and_then(|s| s.get(key));
        if current != Some(value) {
            target.with_section(Some(section_name.as_str())).set(key, value);
            changed.push(format!("{}={}", key, value));
        }
    }
    if changed.is_empty() {
        debug!("{} already matches backup-my.cnf", target_cnf.display());
    } else {
        warn!("rewriting {} with {}", target_cnf.display(), changed.join(" "));
        target.write_to_file(target_cnf)?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_defaults_file() {
        // Create a temporary file with sample MySQL defaults
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[client]").unwrap();
        writeln!(file, "host = localhost").unwrap();
        writeln!(file, "port = 3306").unwrap();
        writeln!(file, "user = testuser").unwrap();
        writeln!(file, "password = testpass").unwrap();
        writeln!(file, "socket = /tmp/mysql.sock").unwrap();

        let options = MySqlConnectOptions::from_defaults_file(file.path()).unwrap();

        assert_eq!(options.get_host(), "localhost");
        assert_eq!(options.get_port(), 3306);
        assert_eq!(options.get_username(), "testuser");
        assert_eq!(options.get_socket(), Some(Path::new("/tmp/mysql.sock").to_path_buf()).as_ref());
    }

    #[test]
    fn test_from_defaults_file_invalid_port() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[client]").unwrap();
        writeln!(file, "port = invalid").unwrap();

        let result = MySqlConnectOptions::from_defaults_file(file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_write_client_defaults() {
        let file = write_client_defaults("127.0.0.1", 3307, "ADMIN", "p@ss").unwrap();
        let conf = Ini::load_from_file(file.path()).unwrap();
        let client = conf.section(Some("client")).unwrap();
        assert_eq!(client.get("port"), Some("3307"));
        assert_eq!(client.get("password"), Some("p@ss"));
    }

    #[test]
    fn test_parse_init_command() {
        let (session, global) =
            parse_init_command("set names utf8mb4; SET foreign_key_checks = 0;set global max_allowed_packet=1073741824")
                .unwrap();
        assert_eq!(
            session,
            vec![
                ("names".to_string(), "utf8mb4".to_string()),
                ("foreign_key_checks".to_string(), "0".to_string())
            ]
        );
        assert_eq!(global, vec![("max_allowed_packet".to_string(), "1073741824".to_string())]);
        assert!(parse_init_command("truncate t1").is_err());
    }

    #[test]
    fn test_myloader_defaults_sections() {
        let file = write_myloader_defaults("set sql_log_bin=0;set @@global.wait_timeout=600").unwrap();
        let conf = Ini::load_from_file(file.path()).unwrap();
        assert_eq!(conf.section(Some("myloader_session_variables")).unwrap().get("sql_log_bin"), Some("0"));
        assert_eq!(conf.section(Some("myloader_global_variables")).unwrap().get("wait_timeout"), Some("600"));
    }

    #[test]
    fn test_merge_backup_my_cnf() {
        let mut backup = NamedTempFile::new().unwrap();
        writeln!(backup, "[mysqld]").unwrap();
        writeln!(backup, "innodb_log_file_size=268435456").unwrap();
        writeln!(backup, "innodb_page_size=16384").unwrap();
        writeln!(backup, "server_id=12").unwrap();
        let mut target = NamedTempFile::new().unwrap();
        writeln!(target, "[mysqld3306]").unwrap();
        writeln!(target, "datadir=/data/mysqldata/3306/data").unwrap();
        writeln!(target, "innodb_page_size=16384").unwrap();
        writeln!(target, "server_id=99").unwrap();

        let changed = merge_backup_my_cnf(backup.path(), target.path(), Some(3306)).unwrap();
        assert_eq!(changed, vec!["innodb_log_file_size=268435456"]);

        let conf = Ini::load_from_file(target.path()).unwrap();
        let section = conf.section(Some("mysqld3306")).unwrap();
        assert_eq!(section.get("innodb_log_file_size"), Some("268435456"));
        assert_eq!(section.get("server_id"), Some("99"));
    }
}
