//! Run a command into a log file while tailing auxiliary logs into it.
//!
//! Every auxiliary source gets its own tailing task. The tasks start before
//! the command, stop as soon as it exits and are always joined before
//! [`LogWatcher::execute`] returns. Output still buffered in the command's
//! pipes is drained for a bounded time after exit, so a background process
//! that inherited them cannot hold the call open.

use hipster_core::error::WorkerError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// A command to run: program, arguments, environment and working directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl WatchedCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// `sh -c <script>`, for commands configured as a single string.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
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

    pub fn envs<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Human-readable rendering, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_escape)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// An auxiliary log and the tag its lines are prefixed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedLog {
    pub tag: String,
    pub path: PathBuf,
}

impl WatchedLog {
    pub fn new(tag: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            tag: tag.into(),
            path: path.into(),
        }
    }
}

type SharedLog = Arc<Mutex<File>>;

#[derive(Debug, Clone)]
pub struct LogWatcher {
    poll_interval: Duration,
    output_drain: Duration,
}

impl Default for LogWatcher {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            output_drain: DEFAULT_OUTPUT_DRAIN,
        }
    }
}

impl LogWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..Self::default()
        }
    }

    /// How long to keep reading the command's output after it exits.
    pub fn output_drain(mut self, drain: Duration) -> Self {
        self.output_drain = drain;
        self
    }

    /// Run `command`, appending its combined output to `log_path` and
    /// copying new lines from each of `watch` into the same file.
    /// Returns the exit code; a command killed by a signal reports -1.
    pub async fn execute(
        &self,
        command: &WatchedCommand,
        log_path: &Path,
        watch: &[WatchedLog],
    ) -> Result<i32, WorkerError> {
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;
        let log: SharedLog = Arc::new(Mutex::new(log_file));

        info!(log = %log_path.display(), "Running {}", command.display());

        let stop = CancellationToken::new();
        let mut tails = Vec::with_capacity(watch.len());
        for source in watch {
            // Taken before the command starts so nothing it writes is skipped.
            let start_offset = tokio::fs::metadata(&source.path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            tails.push(tokio::spawn(tail_log(
                source.clone(),
                start_offset,
                log.clone(),
                stop.clone(),
                self.poll_interval,
            )));
        }

        let result = run_command(command, &log, &stop, self.output_drain).await;

        stop.cancel();
        for joined in futures::future::join_all(tails).await {
            if let Err(e) = joined {
                warn!("Log tailing task ended abnormally: {}", e);
            }
        }
        log.lock().await.flush().await?;

        let code = result?;
        debug!(exit_code = code, "Command finished");
        Ok(code)
    }
}

async fn run_command(
    command: &WatchedCommand,
    log: &SharedLog,
    stop: &CancellationToken,
    drain: Duration,
) -> Result<i32, WorkerError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(&command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &command.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|e| {
        WorkerError::Execution(format!("failed to spawn {}: {}", command.program, e))
    })?;

    let stdout = child.stdout.take().map(|out| tokio::spawn(copy_lines(out, log.clone())));
    let stderr = child.stderr.take().map(|err| tokio::spawn(copy_lines(err, log.clone())));

    let status = child.wait().await;
    stop.cancel();

    // Readers only see EOF once every process holding the pipes is gone.
    let mut readers: Vec<_> = [stdout, stderr].into_iter().flatten().collect();
    let drained = tokio::time::timeout(drain, async {
        for reader in readers.iter_mut() {
            match reader.await {
                Ok(Err(e)) => warn!("Lost command output: {}", e),
                Err(e) => warn!("Output reader ended abnormally: {}", e),
                Ok(Ok(())) => {}
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Output of {} still open after exit, no longer reading it", command.program);
        for reader in &readers {
            reader.abort();
        }
    }

    let status = status?;
    Ok(status.code().unwrap_or(-1))
}

async fn copy_lines<R>(stream: R, log: SharedLog) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }
        log.lock().await.write_all(&line).await?;
    }
}

/// Copy lines appended to `source` into `log` until `stop` fires.
///
/// Reading starts at `start_offset`: the size the file had when the command
/// started, or 0 for a file that did not exist yet. Missing files are polled
/// for until they appear.
async fn tail_log(
    source: WatchedLog,
    start_offset: u64,
    log: SharedLog,
    stop: CancellationToken,
    poll: Duration,
) {
    let file = loop {
        match File::open(&source.path).await {
            Ok(file) => break file,
            Err(_) => {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    };

    let mut reader = BufReader::new(file);
    if start_offset > 0 {
        if let Err(e) = reader.seek(std::io::SeekFrom::Start(start_offset)).await {
            warn!("Cannot seek {}: {}", source.path.display(), e);
            return;
        }
    }
    debug!("Tailing {} as {}", source.path.display(), source.tag);

    let mut pending: Vec<u8> = Vec::new();
    loop {
        match reader.read_until(b'\n', &mut pending).await {
            Ok(0) => {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            Ok(_) => {
                // Hold back a partial final line until its newline arrives.
                if !pending.ends_with(b"\n") {
                    continue;
                }
                let line = format!("{} {}", source.tag, String::from_utf8_lossy(&pending));
                pending.clear();
                let mut file = log.lock().await;
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!("Cannot write tailed line from {}: {}", source.path.display(), e);
                    return;
                }
            }
            Err(e) => {
                warn!("Stopped tailing {}: {}", source.path.display(), e);
                return;
            }
        }
        if stop.is_cancelled() {
            return;
        }
    }
}

pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
