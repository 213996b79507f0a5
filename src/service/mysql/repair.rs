//! Post copy-back fixes: account hosts, the ADMIN account and MyISAM tables.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use log::{info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use crate::config::SYSTEM_DBS;
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::runner::MyExec;
use crate::service::mysql::mysql_service::{quote_ident, quote_str, row_string, MySQLService};
use crate::utils::find_tool;
use crate::version::MysqlVersion;

/// Accounts that are tied to one machine and must not follow the data.
pub const SYSTEM_ACCOUNTS: [&str; 3] = ["ADMIN", "sync", "repl"];

pub const ADMIN_USER: &str = "ADMIN";

pub const REPAIR_WORKERS: usize = 4;

fn account_list() -> String {
    SYSTEM_ACCOUNTS.iter().map(|u| quote_str(u)).collect::<Vec<_>>().join(",")
}

/// Move every account from the source host to the target host, dropping the
/// per-machine system accounts of the source.
pub fn account_host_statements(source_host: &str, target_host: &str, is_80: bool) -> Vec<String> {
    if source_host == target_host {
        return Vec::new();
    }
    let src = quote_str(source_host);
    let tgt = quote_str(target_host);
    let accounts = account_list();
    let mut tables = vec!["mysql.user", "mysql.db", "mysql.tables_priv"];
    if is_80 {
        tables.push("mysql.global_grants");
    }

    let mut sql = Vec::new();
    for table in &tables {
        sql.push(format!("DELETE FROM {} WHERE User IN ({}) AND Host = {}", table, accounts, src));
    }
    for table in &tables {
        sql.push(format!("UPDATE {} SET Host = {} WHERE Host = {}", table, tgt, src));
    }
    sql.push("FLUSH PRIVILEGES".to_string());
    sql
}

pub fn admin_hosts(target_host: &str) -> Vec<String> {
    let mut hosts = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    if !hosts.iter().any(|h| h == target_host) {
        hosts.push(target_host.to_string());
    }
    hosts
}

fn set_password_sql(account: &str, password: &str, version: &MysqlVersion) -> String {
    if version.uses_alter_user_password() {
        format!(
            "ALTER USER {} IDENTIFIED WITH mysql_native_password BY {}",
            account,
            quote_str(password)
        )
    } else {
        format!("SET PASSWORD FOR {} = PASSWORD({})", account, quote_str(password))
    }
}

/// Bootstrap grants for an ADMIN account on one host.
fn admin_template(account: &str, password: &str) -> Vec<String> {
    vec![
        format!("CREATE USER {} IDENTIFIED BY {}", account, quote_str(password)),
        format!("GRANT ALL PRIVILEGES ON *.* TO {} WITH GRANT OPTION", account),
    ]
}

/// Reconcile ADMIN rows to exactly localhost, 127.0.0.1 and the target host.
pub fn admin_statements(
    existing_hosts: &[String],
    target_host: &str,
    password: &str,
    version: &MysqlVersion,
) -> Vec<String> {
    let wanted = admin_hosts(target_host);
    let mut sql = Vec::new();
    for host in existing_hosts {
        if !wanted.contains(host) {
            sql.push(format!("DROP USER {}@{}", quote_str(ADMIN_USER), quote_str(host)));
        }
    }
    for host in &wanted {
        let account = format!("{}@{}", quote_str(ADMIN_USER), quote_str(host));
        if existing_hosts.contains(host) {
            sql.push(set_password_sql(&account, password, version));
        } else {
            sql.extend(admin_template(&account, password));
        }
    }
    sql.push("FLUSH PRIVILEGES".to_string());
    sql
}

pub async fn repair_account_hosts(db: &MySQLService, source_host: &str, target_host: &str, version: &MysqlVersion) -> Result<()> {
    let statements = account_host_statements(source_host, target_host, version.at_least(8, 0, 0));
    if statements.is_empty() {
        return Ok(());
    }
    info!("move accounts from {} to {}", source_host, target_host);
    for sql in statements {
        db.exec(&sql).await?;
    }
    Ok(())
}

pub async fn repair_admin(db: &MySQLService, target_host: &str, password: &str, version: &MysqlVersion) -> Result<()> {
    let existing: Vec<String> = db
        .query_rows(&format!("SELECT Host FROM mysql.user WHERE User = {}", quote_str(ADMIN_USER)))
        .await?
        .iter()
        .map(|r| row_string(r, 0))
        .collect();
    if existing.is_empty() {
        warn!("{} account missing, creating it from template", ADMIN_USER);
    }
    for sql in admin_statements(&existing, target_host, password, version) {
        db.exec(&sql).await?;
    }
    Ok(())
}

/// `myisamchk -r` over the MyISAM indexes of the `mysql` schema, server stopped.
pub async fn myisamchk_system_tables(tool_dir: &Path, datadir: &Path, ctx: &TaskContext) -> Result<usize> {
    let dir = datadir.join("mysql");
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut indexes = Vec::new();
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map(|e| e == "MYI").unwrap_or(false) {
            indexes.push(path);
        }
    }
    if indexes.is_empty() {
        return Ok(0);
    }
    indexes.sort();
    let myisamchk = find_tool(tool_dir, "myisamchk")?;
    for path in &indexes {
        MyExec::new("myisamchk", &myisamchk)
            .arg("-r")
            .arg("-q")
            .arg(path.to_string_lossy())
            .run(ctx)
            .await?;
    }
    Ok(indexes.len())
}

/// Run `job` for each item with at most `limit` in flight; the first error aborts the rest.
pub async fn run_bounded<T, F, Fut>(items: Vec<T>, limit: usize, job: F) -> Result<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();
    for item in items {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| BackupError::Cleanup(e.to_string()))?;
        let fut = job(item);
        set.spawn(async move {
            let result = fut.await;
            drop(permit);
            result
        });
        // Reap finished jobs so an early failure stops new spawns.
        while let Some(done) = set.try_join_next() {
            if let Err(e) = flatten(done) {
                set.abort_all();
                return Err(e);
            }
        }
    }
    while let Some(done) = set.join_next().await {
        if let Err(e) = flatten(done) {
            set.abort_all();
            return Err(e);
        }
    }
    Ok(())
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| BackupError::Cleanup(format!("repair worker: {}", e)))?
}

/// `REPAIR TABLE` result rows are (Table, Op, Msg_type, Msg_text).
pub fn repair_failure(rows: &[(String, String)]) -> Option<String> {
    rows.iter()
        .find(|(msg_type, _)| msg_type.eq_ignore_ascii_case("error"))
        .map(|(_, text)| text.clone())
}

/// Online `REPAIR TABLE` for user MyISAM tables.
pub async fn repair_myisam_tables(db: &MySQLService) -> Result<usize> {
    let excluded = SYSTEM_DBS.iter().map(|d| quote_str(d)).collect::<Vec<_>>().join(",");
    let rows = db
        .query_rows(&format!(
            "SELECT TABLE_SCHEMA, TABLE_NAME FROM information_schema.TABLES \
             WHERE ENGINE = 'MyISAM' AND TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA NOT IN ({})",
            excluded
        ))
        .await?;
    let tables: Vec<String> = rows
        .iter()
        .map(|r| format!("{}.{}", quote_ident(&row_string(r, 0)), quote_ident(&row_string(r, 1))))
        .collect();
    let count = tables.len();
    if count == 0 {
        return Ok(0);
    }
    info!("repair {} MyISAM tables", count);
    run_bounded(tables, REPAIR_WORKERS, |table| {
        let db = db.clone();
        async move {
            let rows = db.query_rows(&format!("REPAIR TABLE {}", table)).await?;
            let messages: Vec<(String, String)> = rows.iter().map(|r| (row_string(r, 2), row_string(r, 3))).collect();
            match repair_failure(&messages) {
                Some(text) => Err(BackupError::tool("repair table", format!("{}: {}", table, text))),
                None => Ok(()),
            }
        }
    })
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_account_host_statements() {
        assert!(account_host_statements("10.0.0.1", "10.0.0.1", false).is_empty());

        let sql = account_host_statements("10.0.0.1", "10.0.0.2", false);
        assert_eq!(
            sql[0],
            "DELETE FROM mysql.user WHERE User IN ('ADMIN','sync','repl') AND Host = '10.0.0.1'"
        );
        assert!(sql.contains(&"UPDATE mysql.tables_priv SET Host = '10.0.0.2' WHERE Host = '10.0.0.1'".to_string()));
        assert!(!sql.iter().any(|s| s.contains("global_grants")));
        assert_eq!(sql.last().unwrap(), "FLUSH PRIVILEGES");

        let sql80 = account_host_statements("10.0.0.1", "10.0.0.2", true);
        assert!(sql80.iter().any(|s| s.contains("mysql.global_grants")));
    }

    #[test]
    fn test_admin_statements() {
        let v56 = MysqlVersion::parse("5.6.24-tmysql-2.1.4-log").unwrap();
        let v57 = MysqlVersion::parse("5.7.20").unwrap();

        let existing = vec!["localhost".to_string(), "10.0.0.1".to_string()];
        let sql = admin_statements(&existing, "10.0.0.2", "pw", &v57);
        assert_eq!(sql[0], "DROP USER 'ADMIN'@'10.0.0.1'");
        assert_eq!(sql[1], "ALTER USER 'ADMIN'@'localhost' IDENTIFIED WITH mysql_native_password BY 'pw'");
        assert!(sql.contains(&"CREATE USER 'ADMIN'@'127.0.0.1' IDENTIFIED BY 'pw'".to_string()));
        assert!(sql.contains(&"GRANT ALL PRIVILEGES ON *.* TO 'ADMIN'@'10.0.0.2' WITH GRANT OPTION".to_string()));

        let sql = admin_statements(&existing, "10.0.0.2", "pw", &v56);
        assert!(sql.contains(&"SET PASSWORD FOR 'ADMIN'@'localhost' = PASSWORD('pw')".to_string()));

        let fresh = admin_statements(&[], "localhost", "pw", &v57);
        assert_eq!(fresh.iter().filter(|s| s.starts_with("CREATE USER")).count(), 2);
    }

    #[test]
    fn test_repair_failure() {
        let ok = vec![("status".to_string(), "OK".to_string())];
        assert!(repair_failure(&ok).is_none());
        let bad = vec![
            ("info".to_string(), "Wrong bytesec".to_string()),
            ("error".to_string(), "Table is marked as crashed".to_string()),
        ];
        assert_eq!(repair_failure(&bad).unwrap(), "Table is marked as crashed");
    }

    #[tokio::test]
    async fn test_run_bounded_limits_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        run_bounded((0..12).collect::<Vec<u32>>(), 4, |_| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_run_bounded_stops_on_error() {
        let started = Arc::new(AtomicUsize::new(0));
        let err = run_bounded((0..50).collect::<Vec<u32>>(), 2, |i| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                if i == 0 {
                    return Err(BackupError::tool("repair table", "crashed"));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("crashed"));
        assert!(started.load(Ordering::SeqCst) < 50);
    }
}
