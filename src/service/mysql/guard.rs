//! Temporary server mutations that must be undone on every exit path.

use log::{info, warn};
use tokio::runtime::Handle;
use crate::error::Result;
use crate::service::mysql::mysql_service::MySQLService;

/// Multi-threaded replication without GTID makes the physical copy inconsistent.
pub fn needs_single_thread(parallel_workers: u32, gtid_mode: &str) -> bool {
    parallel_workers > 0 && !gtid_mode.eq_ignore_ascii_case("ON")
}

async fn set_parallel_workers(db: &MySQLService, workers: u32) -> Result<()> {
    db.exec("STOP SLAVE SQL_THREAD").await?;
    db.exec(&format!("SET GLOBAL slave_parallel_workers = {}", workers)).await?;
    db.exec("START SLAVE SQL_THREAD").await?;
    Ok(())
}

/// Holds `slave_parallel_workers` at 0 while a physical dump runs.
pub struct ReplicaParallelGuard {
    db: MySQLService,
    previous: Option<u32>,
}

impl ReplicaParallelGuard {
    pub async fn acquire(db: &MySQLService) -> Result<ReplicaParallelGuard> {
        let workers: u32 = db
            .global_variable("slave_parallel_workers")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let gtid_mode = db.global_variable("gtid_mode").await?.unwrap_or_default();
        let mut guard = ReplicaParallelGuard {
            db: db.clone(),
            previous: None,
        };
        if needs_single_thread(workers, &gtid_mode) {
            info!("set slave_parallel_workers from {} to 0 during backup", workers);
            // Stored first so a failure halfway still restores the original value.
            guard.previous = Some(workers);
            set_parallel_workers(db, 0).await?;
        }
        Ok(guard)
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(workers) = self.previous.take() {
            info!("restore slave_parallel_workers to {}", workers);
            set_parallel_workers(&self.db, workers).await?;
        }
        Ok(())
    }
}

impl Drop for ReplicaParallelGuard {
    fn drop(&mut self) {
        let Some(workers) = self.previous.take() else { return };
        let db = self.db.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = set_parallel_workers(&db, workers).await {
                        warn!("restore slave_parallel_workers to {} failed: {}", workers, e);
                    }
                });
            }
            Err(_) => warn!("no runtime to restore slave_parallel_workers to {}", workers),
        }
    }
}

/// Clears `init_connect` so load sessions are not rewritten by it.
pub struct InitConnectGuard {
    db: MySQLService,
    previous: Option<String>,
}

impl InitConnectGuard {
    pub async fn acquire(db: &MySQLService) -> Result<InitConnectGuard> {
        let current = db.init_connect().await?;
        let mut guard = InitConnectGuard {
            db: db.clone(),
            previous: None,
        };
        if !current.is_empty() {
            info!("clear init_connect during load, saved: {}", current);
            guard.previous = Some(current);
            db.set_init_connect("").await?;
        }
        Ok(guard)
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(value) = self.previous.take() {
            info!("restore init_connect");
            self.db.set_init_connect(&value).await?;
        }
        Ok(())
    }
}

impl Drop for InitConnectGuard {
    fn drop(&mut self) {
        let Some(value) = self.previous.take() else { return };
        let db = self.db.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = db.set_init_connect(&value).await {
                        warn!("restore init_connect failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("no runtime to restore init_connect '{}'", value),
        }
    }
}
