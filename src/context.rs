use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, error};
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::error::{BackupError, Result};

/// Backups must have at least this much time left before they start.
pub const MIN_BACKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared by every stage of one task: cancellation, deadline and process kill policy.
#[derive(Clone, Debug)]
pub struct TaskContext {
    cancel: CancellationToken,
    timed_out: Arc<AtomicBool>,
    deadline: Option<Instant>,
    pub kill_delay: Duration,
    /// Delete split/tar parts once they are extracted.
    pub remove_original: bool,
}

impl TaskContext {
    pub fn new(parent: &CancellationToken, kill_delay: Duration) -> TaskContext {
        TaskContext {
            cancel: parent.child_token(),
            timed_out: Arc::new(AtomicBool::new(false)),
            deadline: None,
            kill_delay,
            remove_original: false,
        }
    }

    /// Arm a watchdog that cancels this context once `timeout` has elapsed.
    pub fn with_timeout(mut self, timeout: Duration) -> TaskContext {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(deadline);

        let cancel = self.cancel.clone();
        let timed_out = self.timed_out.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    error!("backup deadline reached, cancelling task");
                    timed_out.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {
                    debug!("task finished before deadline");
                }
            }
        });
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The error a stage should return once it notices cancellation.
    pub fn cancel_error(&self) -> BackupError {
        if self.timed_out.load(Ordering::SeqCst) {
            BackupError::Timeout
        } else {
            BackupError::Cancelled
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(self.cancel_error())
        } else {
            Ok(())
        }
    }

    /// Release the watchdog when the task ends normally.
    pub fn finish(&self) {
        self.cancel.cancel();
    }
}

/// `HH:MM:SS` means "finish by that wall-clock time today, or tomorrow if it already passed".
pub fn parse_clock_deadline(value: &str, now: DateTime<Local>) -> Result<Duration> {
    let time = NaiveTime::parse_from_str(value.trim(), "%H:%M:%S")
        .map_err(|_| BackupError::config(format!("backup_timeout '{}' is not HH:MM:SS", value)))?;
    let mut deadline = now.date_naive().and_time(time);
    if deadline <= now.naive_local() {
        deadline += ChronoDuration::days(1);
    }
    let deadline = Local
        .from_local_datetime(&deadline)
        .earliest()
        .ok_or_else(|| BackupError::config(format!("backup_timeout '{}' does not exist today", value)))?;
    let left = (deadline - now)
        .to_std()
        .map_err(|_| BackupError::config("backup_timeout is in the past"))?;
    Ok(left)
}

/// Remaining time for a backup, rejecting deadlines too close to be useful.
pub fn backup_timeout(value: &str, now: DateTime<Local>) -> Result<Duration> {
    let left = parse_clock_deadline(value, now)?;
    if left < MIN_BACKUP_TIMEOUT {
        return Err(BackupError::precheck(format!(
            "too short timeout: {}s left until {}",
            left.as_secs(),
            value
        )));
    }
    Ok(left)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, h, m, s).earliest().unwrap()
    }

    #[test]
    fn test_deadline_later_today() {
        let left = parse_clock_deadline("09:00:00", at(8, 0, 0)).unwrap();
        assert_eq!(left, Duration::from_secs(3600));
    }

    #[test]
    fn test_deadline_tomorrow() {
        let left = parse_clock_deadline("09:00:00", at(10, 0, 0)).unwrap();
        assert_eq!(left, Duration::from_secs(23 * 3600));
    }

    #[test]
    fn test_too_short_timeout() {
        let err = backup_timeout("08:00:05", at(8, 0, 0)).unwrap_err();
        assert!(matches!(err, BackupError::Precheck(_)));
        assert!(err.to_string().contains("too short timeout"));
        assert!(backup_timeout("9am", at(8, 0, 0)).is_err());
    }

    #[tokio::test]
    async fn test_watchdog_marks_timeout() {
        let root = CancellationToken::new();
        let ctx = TaskContext::new(&root, Duration::from_millis(10)).with_timeout(Duration::from_millis(20));
        ctx.cancelled().await;
        assert!(matches!(ctx.cancel_error(), BackupError::Timeout));
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancel_is_not_timeout() {
        let root = CancellationToken::new();
        let ctx = TaskContext::new(&root, Duration::from_millis(10)).with_timeout(Duration::from_secs(60));
        root.cancel();
        ctx.cancelled().await;
        assert!(matches!(ctx.check(), Err(BackupError::Cancelled)));
    }
}
