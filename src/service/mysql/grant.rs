use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::{debug, info};
use crate::config::BackupConfig;
use crate::context::TaskContext;
use crate::error::Result;
use crate::index::IndexContent;
use crate::service::mysql::mysql_service::{quote_str, row_string, MySQLService};
use crate::service::service::{DumpTarget, Dumper, PackStrategy};
use crate::utils::now_string;
use crate::version::MysqlVersion;

/// Accounts created by the server itself.
pub const SYSTEM_USERS: [&str; 4] = ["mysql.sys", "mysql.session", "mysql.infoschema", "root"];

/// Hosts whose accounts belong to this machine, not to the data.
pub const PRIVATE_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

pub fn is_private_account(user: &str, host: &str) -> bool {
    user.is_empty() || SYSTEM_USERS.contains(&user) || PRIVATE_HOSTS.contains(&host)
}

/// One account's statements in replay order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountGrants {
    pub user: String,
    pub host: String,
    pub create_user: Option<String>,
    pub grants: Vec<String>,
}

pub fn render_priv(accounts: &[AccountGrants]) -> String {
    let mut out = String::new();
    for account in accounts {
        out.push_str(&format!("-- {}@{}\n", account.user, account.host));
        if let Some(create) = &account.create_user {
            // The account may already exist on the target.
            out.push_str(&create.replacen("CREATE USER ", "CREATE USER IF NOT EXISTS ", 1));
            out.push_str(";\n");
        }
        for grant in &account.grants {
            out.push_str(grant);
            out.push_str(";\n");
        }
    }
    out
}

/// Collect `SHOW CREATE USER` and `SHOW GRANTS` for every non-private account.
pub async fn collect_grants(db: &MySQLService, version: &MysqlVersion) -> Result<Vec<AccountGrants>> {
    let rows = db.query_rows("SELECT user, host FROM mysql.user ORDER BY user, host").await?;
    let mut accounts = Vec::new();
    for row in &rows {
        let user = row_string(row, 0);
        let host = row_string(row, 1);
        if is_private_account(&user, &host) {
            debug!("skip private account {}@{}", user, host);
            continue;
        }
        let name = format!("{}@{}", quote_str(&user), quote_str(&host));
        let create_user = if version.supports_show_create_user() {
            db.query_string(&format!("SHOW CREATE USER {}", name)).await?
        } else {
            None
        };
        let grants = db
            .query_rows(&format!("SHOW GRANTS FOR {}", name))
            .await?
            .iter()
            .map(|r| row_string(r, 0))
            .collect();
        accounts.push(AccountGrants {
            user,
            host,
            create_user,
            grants,
        });
    }
    Ok(accounts)
}

/// Write the `.priv` script, returning its size.
pub async fn export_privileges(db: &MySQLService, version: &MysqlVersion, path: &Path) -> Result<u64> {
    let accounts = collect_grants(db, version).await?;
    tokio::fs::write(path, render_priv(&accounts)).await?;
    let size = tokio::fs::metadata(path).await?.len();
    info!("exported {} accounts to {}", accounts.len(), path.display());
    Ok(size)
}

/// `data_schema_grant=grant`: the `.priv` file is the whole backup.
pub struct GrantDumper {
    db: MySQLService,
    target: DumpTarget,
    version: Option<MysqlVersion>,
    begin_time: String,
    end_time: String,
}

impl GrantDumper {
    pub fn new(db: MySQLService, target: DumpTarget) -> GrantDumper {
        GrantDumper {
            db,
            target,
            version: None,
            begin_time: String::new(),
            end_time: String::new(),
        }
    }

    pub fn priv_path(&self) -> PathBuf {
        self.target.priv_path()
    }
}

#[async_trait]
impl Dumper for GrantDumper {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn pack_strategy(&self) -> PackStrategy {
        PackStrategy::None
    }

    async fn init_config(&mut self, version: &MysqlVersion, _log_bin_disabled: bool) -> Result<()> {
        self.version = Some(version.clone());
        Ok(())
    }

    async fn execute(&mut self, ctx: &TaskContext) -> Result<()> {
        ctx.check()?;
        let version = match &self.version {
            Some(v) => v.clone(),
            None => self.db.version().await?,
        };
        self.begin_time = now_string();
        tokio::fs::create_dir_all(&self.target.backup_dir).await?;
        export_privileges(&self.db, &version, &self.priv_path()).await?;
        self.end_time = now_string();
        Ok(())
    }

    async fn finalize_metadata(&mut self, _cnf: &BackupConfig, index: &mut IndexContent, _ctx: &TaskContext) -> Result<()> {
        index.backup_tool = self.name().to_string();
        index.backup_begin_time = self.begin_time.clone();
        index.backup_end_time = self.end_time.clone();
        index.backup_consistent_time = self.begin_time.clone();
        index.refresh_full_backup_flag();
        Ok(())
    }
}
