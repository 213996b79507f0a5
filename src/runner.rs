use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinSet;
use crate::context::TaskContext;
use crate::error::{BackupError, Result};
use crate::utils::mask_args;

/// Keywords grepped out of tool logs when a dump fails.
pub const MYDUMPER_ERROR_KEYWORDS: [&str; 4] = ["ERROR", "CRITICAL", "fatal", "No such file"];
pub const MYLOADER_ERROR_KEYWORDS: [&str; 4] = ["CRITICAL", "not found", "error", "fatal"];
pub const XTRABACKUP_ERROR_KEYWORDS: [&str; 4] = ["ERROR", "error", "fatal", "No such file"];

const ERROR_LINES: usize = 5;

/// Where a process stream goes.
#[derive(Debug, Clone)]
pub enum Sink {
    Discard,
    /// Opened with create + append.
    File(PathBuf),
    /// Collected in memory and returned in [`ExecOutput`].
    Capture,
    Inherit,
}

#[derive(Debug, Clone)]
enum Source {
    Null,
    File(PathBuf),
    /// Caller writes through [`RunningPipeline::take_stdin`].
    Piped,
}

#[derive(Debug, Default)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// One external command: argv, stream wiring and failure diagnostics.
#[derive(Debug, Clone)]
pub struct MyExec {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    stdin: Source,
    stdout: Sink,
    stderr: Sink,
    log_file: Option<PathBuf>,
    keywords: Vec<&'static str>,
    allow_failure: bool,
}

impl MyExec {
    pub fn new<P: AsRef<Path>>(name: &str, program: P) -> MyExec {
        MyExec {
            name: name.to_string(),
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            stdin: Source::Null,
            stdout: Sink::Capture,
            stderr: Sink::Capture,
            log_file: None,
            keywords: Vec::new(),
            allow_failure: false,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Secrets passed this way never show up in the logged command line.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn stdin_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.stdin = Source::File(path.as_ref().to_path_buf());
        self
    }

    pub fn stdin_piped(mut self) -> Self {
        self.stdin = Source::Piped;
        self
    }

    pub fn stdout(mut self, sink: Sink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn stderr(mut self, sink: Sink) -> Self {
        self.stderr = sink;
        self
    }

    /// Append both streams to `path` and grep it for `keywords` on failure.
    pub fn log_to<P: AsRef<Path>>(mut self, path: P, keywords: &[&'static str]) -> Self {
        let path = path.as_ref().to_path_buf();
        self.stdout = Sink::File(path.clone());
        self.stderr = Sink::File(path.clone());
        self.log_file = Some(path);
        self.keywords = keywords.to_vec();
        self
    }

    /// Only stderr to `path`; stdout stays wired to the next pipeline leg.
    pub fn stderr_log_to<P: AsRef<Path>>(mut self, path: P, keywords: &[&'static str]) -> Self {
        let path = path.as_ref().to_path_buf();
        self.stderr = Sink::File(path.clone());
        self.log_file = Some(path);
        self.keywords = keywords.to_vec();
        self
    }

    /// Nonzero exit is reported in [`ExecOutput::success`] instead of as an error.
    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn command_line(&self) -> String {
        format!("{} {}", self.program.display(), mask_args(&self.program, &self.args))
    }

    pub async fn run(self, ctx: &TaskContext) -> Result<ExecOutput> {
        Pipeline::new(self).start()?.wait(ctx).await
    }
}

fn sink_stdio(sink: &Sink) -> io::Result<Stdio> {
    Ok(match sink {
        Sink::Discard => Stdio::null(),
        Sink::Inherit => Stdio::inherit(),
        Sink::Capture => Stdio::piped(),
        Sink::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Stdio::from(file)
        }
    })
}

fn log_len(path: &Option<PathBuf>) -> u64 {
    path.as_ref()
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0)
}

/// First lines written to `path` after `offset` that contain any keyword.
pub fn grep_log(path: &Path, offset: u64, keywords: &[&str], max_lines: usize) -> Vec<String> {
    let Ok(bytes) = std::fs::read(path) else {
        return Vec::new();
    };
    let start = (offset as usize).min(bytes.len());
    String::from_utf8_lossy(&bytes[start..])
        .lines()
        .filter(|line| keywords.iter().any(|k| line.contains(k)))
        .take(max_lines)
        .map(str::to_string)
        .collect()
}

/// A chain of processes where each stdout feeds the next stdin.
pub struct Pipeline {
    legs: Vec<MyExec>,
    timeout: Option<Duration>,
}

impl Pipeline {
    pub fn new(first: MyExec) -> Pipeline {
        Pipeline {
            legs: vec![first],
            timeout: None,
        }
    }

    pub fn pipe(mut self, next: MyExec) -> Pipeline {
        self.legs.push(next);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Pipeline {
        self.timeout = Some(timeout);
        self
    }

    pub fn command_line(&self) -> String {
        self.legs
            .iter()
            .map(MyExec::command_line)
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Spawn every leg. Nothing is awaited yet.
    pub fn start(self) -> Result<RunningPipeline> {
        info!("exec: {}", self.command_line());
        let count = self.legs.len();
        let mut children = Vec::with_capacity(count);
        let mut captures = Vec::new();
        let mut upstream: Option<Stdio> = None;
        let mut stdin = None;

        for (i, leg) in self.legs.iter().enumerate() {
            let mut cmd = Command::new(&leg.program);
            cmd.args(&leg.args).kill_on_drop(true);
            cmd.envs(leg.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            if let Some(dir) = &leg.current_dir {
                cmd.current_dir(dir);
            }

            match upstream.take() {
                Some(stdio) => {
                    cmd.stdin(stdio);
                }
                None => match &leg.stdin {
                    Source::Null => {
                        cmd.stdin(Stdio::null());
                    }
                    Source::Piped => {
                        cmd.stdin(Stdio::piped());
                    }
                    Source::File(path) => {
                        cmd.stdin(Stdio::from(std::fs::File::open(path)?));
                    }
                },
            }

            let last = i + 1 == count;
            if last {
                cmd.stdout(sink_stdio(&leg.stdout)?);
            } else {
                cmd.stdout(Stdio::piped());
            }
            cmd.stderr(sink_stdio(&leg.stderr)?);

            let offset = log_len(&leg.log_file);
            let mut child = cmd.spawn().map_err(|e| {
                BackupError::tool(&leg.name, format!("spawn {}: {}", leg.program.display(), e))
            })?;

            if i == 0 && matches!(leg.stdin, Source::Piped) {
                stdin = child.stdin.take();
            }
            if !last {
                if let Some(out) = child.stdout.take() {
                    let stdio: Stdio = out.try_into()?;
                    upstream = Some(stdio);
                }
            } else if matches!(leg.stdout, Sink::Capture) {
                if let Some(mut out) = child.stdout.take() {
                    captures.push((i, false, tokio::spawn(async move {
                        let mut buf = Vec::new();
                        out.read_to_end(&mut buf).await.map(|_| buf)
                    })));
                }
            }
            if matches!(leg.stderr, Sink::Capture) {
                if let Some(mut err) = child.stderr.take() {
                    captures.push((i, true, tokio::spawn(async move {
                        let mut buf = Vec::new();
                        err.read_to_end(&mut buf).await.map(|_| buf)
                    })));
                }
            }
            children.push(LegProcess {
                exec: leg.clone(),
                child: Some(child),
                log_offset: offset,
            });
        }

        Ok(RunningPipeline {
            legs: children,
            captures,
            stdin,
            timeout: self.timeout,
        })
    }
}

struct LegProcess {
    exec: MyExec,
    child: Option<Child>,
    log_offset: u64,
}

type CaptureHandle = tokio::task::JoinHandle<io::Result<Vec<u8>>>;

pub struct RunningPipeline {
    legs: Vec<LegProcess>,
    captures: Vec<(usize, bool, CaptureHandle)>,
    stdin: Option<ChildStdin>,
    timeout: Option<Duration>,
}

impl RunningPipeline {
    /// Writer end for a pipeline started with [`MyExec::stdin_piped`].
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.legs
            .iter()
            .filter_map(|l| l.child.as_ref().and_then(Child::id))
            .collect()
    }

    /// Join all legs. The first failing leg kills the rest; cancellation
    /// sends SIGINT, waits `kill_delay`, then kills.
    pub async fn wait(mut self, ctx: &TaskContext) -> Result<ExecOutput> {
        drop(self.stdin.take());
        let count = self.legs.len();
        let mut pids: Vec<Option<u32>> = self.legs.iter().map(|l| l.child.as_ref().and_then(Child::id)).collect();
        let mut set = JoinSet::new();
        for (i, leg) in self.legs.iter_mut().enumerate() {
            if let Some(mut child) = leg.child.take() {
                set.spawn(async move { (i, child.wait().await) });
            }
        }

        let mut statuses: Vec<Option<ExitStatus>> = vec![None; count];
        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    let (i, status) = joined.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                    let status = status?;
                    pids[i] = None;
                    statuses[i] = Some(status);
                    if !status.success() && !self.legs[i].exec.allow_failure && pids.iter().any(Option::is_some) {
                        warn!("{} exited with {}, stopping the rest of the pipeline", self.legs[i].exec.name, status);
                        signal_all(&pids, Signal::SIGKILL);
                    }
                }
                _ = ctx.cancelled() => {
                    terminate(&pids, ctx.kill_delay).await;
                    set.abort_all();
                    return Err(ctx.cancel_error());
                }
                _ = &mut deadline => {
                    terminate(&pids, ctx.kill_delay).await;
                    set.abort_all();
                    let name = self.legs.last().map(|l| l.exec.name.clone()).unwrap_or_default();
                    return Err(BackupError::tool(name, "timeout exceeded"));
                }
            }
        }

        let mut output = ExecOutput {
            success: true,
            ..Default::default()
        };
        let mut stderrs: Vec<Vec<u8>> = vec![Vec::new(); count];
        for (i, is_err, handle) in self.captures.drain(..) {
            let buf = handle
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
            if is_err {
                stderrs[i] = buf;
            } else if i + 1 == count {
                output.stdout = buf;
            }
        }
        output.stderr = stderrs.last().cloned().unwrap_or_default();

        let mut failures = Vec::new();
        for (i, leg) in self.legs.iter().enumerate() {
            let Some(status) = statuses[i] else { continue };
            if status.success() {
                continue;
            }
            output.success = false;
            if leg.exec.allow_failure {
                continue;
            }
            let mut detail = match &leg.exec.log_file {
                Some(path) => grep_log(path, leg.log_offset, &leg.exec.keywords, ERROR_LINES),
                None => Vec::new(),
            };
            if detail.is_empty() {
                detail = String::from_utf8_lossy(&stderrs[i])
                    .lines()
                    .rev()
                    .take(ERROR_LINES)
                    .map(str::to_string)
                    .collect::<Vec<_>>();
                detail.reverse();
            }
            let mut message = format!("{}", status);
            if !detail.is_empty() {
                message.push('\n');
                message.push_str(&detail.join("\n"));
            }
            if let Some(path) = &leg.exec.log_file {
                message.push_str(&format!("\nsee {}", path.display()));
            }
            failures.push((leg.exec.name.clone(), message));
        }

        if let Some((name, _)) = failures.first() {
            let name = name.clone();
            let message = failures
                .into_iter()
                .map(|(n, m)| format!("[{}] {}", n, m))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(BackupError::tool(name, message));
        }
        debug!("pipeline finished ok");
        Ok(output)
    }
}

fn signal_all(pids: &[Option<u32>], signal: Signal) {
    for pid in pids.iter().flatten() {
        if let Err(e) = kill(Pid::from_raw(*pid as i32), signal) {
            debug!("signal {} to {}: {}", signal, pid, e);
        }
    }
}

/// SIGINT first so dumpers can release locks and flush, SIGKILL after `delay`.
async fn terminate(pids: &[Option<u32>], delay: Duration) {
    warn!("terminating child processes {:?}", pids.iter().flatten().collect::<Vec<_>>());
    signal_all(pids, Signal::SIGINT);
    tokio::time::sleep(delay).await;
    signal_all(pids, Signal::SIGKILL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> TaskContext {
        TaskContext::new(&CancellationToken::new(), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_capture_stdout() {
        let out = MyExec::new("echo", "sh").args(["-c", "echo hello"]).run(&ctx()).await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout_str(), "hello\n");
    }

    #[tokio::test]
    async fn test_pipeline_joins_processes() {
        let out = Pipeline::new(MyExec::new("printf", "sh").args(["-c", "printf 'a\\nb\\nc\\n'"]))
            .pipe(MyExec::new("grep", "grep").arg("b"))
            .start()
            .unwrap()
            .wait(&ctx())
            .await
            .unwrap();
        assert_eq!(out.stdout_str(), "b\n");
    }

    #[tokio::test]
    async fn test_failure_greps_log() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("mydumper_3306_1.log");
        std::fs::write(&log, "** (mydumper): CRITICAL old run\n").unwrap();
        let err = MyExec::new("mydumper", "sh")
            .args(["-c", "echo 'ok line'; echo '** (mydumper): CRITICAL Error connecting'; exit 3"])
            .log_to(&log, &MYDUMPER_ERROR_KEYWORDS)
            .run(&ctx())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("mydumper failed"));
        assert!(msg.contains("CRITICAL Error connecting"));
        assert!(!msg.contains("old run"));
        assert!(!msg.contains("ok line"));
    }

    #[tokio::test]
    async fn test_allow_failure() {
        let out = MyExec::new("false", "false").allow_failure().run(&ctx()).await.unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn test_upstream_failure_fails_pipeline() {
        let err = Pipeline::new(MyExec::new("producer", "sh").args(["-c", "echo x; exit 1"]))
            .pipe(MyExec::new("cat", "cat").stdout(Sink::Discard))
            .start()
            .unwrap()
            .wait(&ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Tool { ref tool, .. } if tool == "producer"));
    }

    #[tokio::test]
    async fn test_cancel_kills_children() {
        let ctx = ctx();
        let running = MyExec::new("sleep", "sleep").arg("30").start_for_test();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let err = running.wait(&ctx).await.unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_piped_stdin() {
        let mut running = Pipeline::new(MyExec::new("cat", "cat").stdin_piped()).start().unwrap();
        let mut stdin = running.take_stdin().unwrap();
        stdin.write_all(b"streamed").await.unwrap();
        drop(stdin);
        let out = running.wait(&ctx()).await.unwrap();
        assert_eq!(out.stdout_str(), "streamed");
    }

    impl MyExec {
        fn start_for_test(self) -> RunningPipeline {
            Pipeline::new(self).start().unwrap()
        }
    }
}
