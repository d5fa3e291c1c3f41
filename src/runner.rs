use crate::adapters::codex::CodexAdapter;
use crate::adapters::{Adapter, ValidatedCommand};
use crate::config::RunnerSettings;
use crate::errors::AppResult;
use crate::events::{self, EventStreamDecoder};
use crate::harness::failure::{classify_exit, tail_chars, MAX_DETAILS_CHARS};
use crate::models::{
    ErrorKind, ExecutionError, ExecutionOptions, ExecutionRequest, ExecutionResult,
    ExecutionSuccess,
};
use crate::policy::PolicyEngine;
use crate::redaction::OutputSanitizer;
use crate::scheduler::{ConcurrencyGate, GatePermit};
use chrono::Utc;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

const READ_CHUNK_BYTES: usize = 8192;
const MAX_DEADLINE_SECS: u64 = 60 * 60 * 24 * 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

struct StreamChunk {
    stream: StreamKind,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct CapturedOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    decoder: Option<EventStreamDecoder>,
}

impl CapturedOutput {
    fn new(structured: bool) -> Self {
        Self {
            decoder: structured.then(EventStreamDecoder::new),
            ..Self::default()
        }
    }

    /// Stores a chunk and returns the new size of its stream.
    fn push(&mut self, chunk: StreamChunk) -> usize {
        match chunk.stream {
            StreamKind::Stdout => {
                if let Some(decoder) = self.decoder.as_mut() {
                    decoder.push(&chunk.bytes);
                }
                self.stdout.extend_from_slice(&chunk.bytes);
                self.stdout.len()
            }
            StreamKind::Stderr => {
                self.stderr.extend_from_slice(&chunk.bytes);
                self.stderr.len()
            }
        }
    }

    fn combined_text(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr);
        let stdout = String::from_utf8_lossy(&self.stdout);
        format!("{}\n{}", stderr.trim(), stdout.trim())
    }
}

/// Everything one `execute` call owns. `finalize` is the only way out: the
/// first outcome wins and every later attempt is discarded.
struct ActiveRun {
    child: Option<Child>,
    exited: bool,
    permit: Option<GatePermit>,
    outcome: Option<ExecutionResult>,
    sanitizer: OutputSanitizer,
    kill_grace: Duration,
}

impl ActiveRun {
    fn new(permit: GatePermit, sanitizer: OutputSanitizer, kill_grace: Duration) -> Self {
        Self {
            child: None,
            exited: false,
            permit: Some(permit),
            outcome: None,
            sanitizer,
            kill_grace,
        }
    }

    fn is_finalized(&self) -> bool {
        self.outcome.is_some()
    }

    /// Returns `false` when an outcome was already recorded.
    fn finalize(&mut self, outcome: ExecutionResult) -> bool {
        if self.is_finalized() {
            tracing::debug!("discarding outcome after finalize");
            return false;
        }

        if let Some(child) = self.child.take() {
            if !self.exited {
                terminate_then_kill(child, self.kill_grace);
            }
        }

        let outcome = outcome.map_err(|error| self.sanitize_error(error));
        match &outcome {
            Ok(success) => tracing::info!(
                duration_ms = success.duration_ms,
                files_changed = success.files_changed.len(),
                commands_run = success.commands_run.len(),
                "codex run succeeded"
            ),
            Err(error) => tracing::warn!(kind = %error.kind, message = %error.message, "codex run failed"),
        }

        if let Some(permit) = self.permit.take() {
            permit.release();
        }
        self.outcome = Some(outcome);
        true
    }

    fn sanitize_error(&self, mut error: ExecutionError) -> ExecutionError {
        error.message = self.sanitizer.sanitize(&error.message);
        if let Some(details) = error.details.take() {
            let redacted = self.sanitizer.redact(&details);
            if redacted.redaction_count > 0 {
                tracing::debug!(count = redacted.redaction_count, "redacted sensitive text from error details");
            }
            error.details = Some(tail_chars(&redacted.content, MAX_DETAILS_CHARS));
        }
        error
    }

    fn into_outcome(mut self) -> ExecutionResult {
        self.outcome.take().unwrap_or_else(|| {
            Err(ExecutionError::new(
                ErrorKind::Unknown,
                "Codex run ended without an outcome",
            ))
        })
    }
}

/// Launches the Codex CLI for one prompt at a time per gate slot.
#[derive(Clone)]
pub struct Runner {
    gate: ConcurrencyGate,
    policy: PolicyEngine,
    sanitizer: OutputSanitizer,
    adapter: Arc<dyn Adapter>,
    binary_path: String,
    default_timeout_ms: u64,
    output_limit: usize,
    kill_grace: Duration,
}

impl Runner {
    pub fn new(settings: &RunnerSettings, gate: ConcurrencyGate) -> Self {
        Self {
            gate,
            policy: PolicyEngine::new(settings),
            sanitizer: OutputSanitizer::new(),
            adapter: Arc::new(CodexAdapter),
            binary_path: settings.codex_path.clone(),
            default_timeout_ms: settings.default_timeout_ms,
            output_limit: settings.output_limit_bytes,
            kill_grace: settings.kill_grace(),
        }
    }

    pub fn from_settings(settings: &RunnerSettings) -> AppResult<Self> {
        settings.validate()?;
        let gate = ConcurrencyGate::new(settings.max_concurrency)?;
        Ok(Self::new(settings, gate))
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Options carrying the configured `default_timeout_ms`.
    pub fn default_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            timeout_ms: self.default_timeout_ms,
            ..ExecutionOptions::default()
        }
    }

    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "codex_run",
            run_id = %run_id,
            adapter = self.adapter.name(),
            structured = request.options().structured_output,
        );
        self.execute_inner(request).instrument(span).await
    }

    async fn execute_inner(&self, request: &ExecutionRequest) -> ExecutionResult {
        let permit = self.gate.acquire().await;
        let mut run = ActiveRun::new(permit, self.sanitizer, self.kill_grace);
        let started_at = Utc::now();
        let started = Instant::now();
        let options = request.options();
        // The clock runs from the moment a slot is granted, so launch time
        // counts against the timeout but queueing at the gate does not.
        let deadline = started
            .checked_add(options.timeout())
            .unwrap_or_else(|| started + Duration::from_secs(MAX_DEADLINE_SECS));

        if let Err(error) = self.policy.validate_options(options) {
            run.finalize(Err(ExecutionError::new(
                ErrorKind::PermissionDenied,
                error.to_string(),
            )));
            return run.into_outcome();
        }

        let command = match self.adapter.build_command(request, &self.binary_path) {
            Ok(command) => command,
            Err(error) => {
                run.finalize(Err(error));
                return run.into_outcome();
            }
        };

        let mut child = match spawn_child(&command) {
            Ok(child) => child,
            Err(error) => {
                run.finalize(Err(self.spawn_error(&command, error)));
                return run.into_outcome();
            }
        };
        tracing::info!(
            pid = child.id().unwrap_or_default(),
            args = command.args.len(),
            timeout_ms = options.timeout_ms,
            "launched codex"
        );

        let mut stdin_task = child
            .stdin
            .take()
            .map(|stdin| tokio::spawn(write_prompt(stdin, command.stdin.clone().into_bytes())));

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<StreamChunk>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_stream(stdout, StreamKind::Stdout, chunk_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stream(stderr, StreamKind::Stderr, chunk_tx.clone()));
        }
        drop(chunk_tx);
        run.child = Some(child);

        let mut captured = CapturedOutput::new(options.structured_output);
        let mut exit_status: Option<ExitStatus> = None;
        let mut streams_open = true;
        let deadline_timer = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline_timer);

        while !run.is_finalized() && (exit_status.is_none() || streams_open) {
            tokio::select! {
                chunk = chunk_rx.recv(), if streams_open => match chunk {
                    Some(chunk) => {
                        let stream = chunk.stream;
                        let size = captured.push(chunk);
                        if size > self.output_limit {
                            tracing::warn!(stream = stream.as_str(), size, limit = self.output_limit, "output limit exceeded");
                            run.finalize(Err(ExecutionError::new(
                                ErrorKind::OutputTooLarge,
                                format!(
                                    "Codex {} exceeded {} bytes (measured {} bytes)",
                                    stream.as_str(),
                                    self.output_limit,
                                    size
                                ),
                            )));
                        }
                    }
                    None => streams_open = false,
                },
                status = wait_child(&mut run.child), if exit_status.is_none() => match status {
                    Ok(status) => {
                        run.exited = true;
                        exit_status = Some(status);
                    }
                    Err(error) => {
                        run.finalize(Err(ExecutionError::new(
                            ErrorKind::Unknown,
                            "Failed to wait for the Codex process",
                        )
                        .with_details(error.to_string())));
                    }
                },
                written = join_writer(&mut stdin_task), if stdin_task.is_some() => {
                    stdin_task = None;
                    match written {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) if error.kind() == std::io::ErrorKind::BrokenPipe => {
                            tracing::debug!("codex closed stdin before the prompt was fully written");
                        }
                        Ok(Err(error)) => {
                            run.finalize(Err(ExecutionError::new(
                                ErrorKind::InputWriteFailed,
                                "Failed to write the prompt to Codex",
                            )
                            .with_details(error.to_string())));
                        }
                        Err(error) => {
                            run.finalize(Err(ExecutionError::new(
                                ErrorKind::InputWriteFailed,
                                "Prompt writer task failed",
                            )
                            .with_details(error.to_string())));
                        }
                    }
                },
                _ = &mut deadline_timer => {
                    tracing::warn!(timeout_ms = options.timeout_ms, "codex run timed out");
                    run.finalize(Err(ExecutionError::new(
                        ErrorKind::Timeout,
                        format!("Codex timed out after {} ms", options.timeout_ms),
                    )));
                }
            }
        }

        if let Some(task) = stdin_task.take() {
            task.abort();
        }

        if !run.is_finalized() {
            let outcome = match exit_status {
                Some(status) => self.outcome_for_exit(status, captured, started_at, started),
                None => Err(ExecutionError::new(
                    ErrorKind::Unknown,
                    "Codex output closed without an exit status",
                )),
            };
            run.finalize(outcome);
        }

        run.into_outcome()
    }

    fn outcome_for_exit(
        &self,
        status: ExitStatus,
        captured: CapturedOutput,
        started_at: chrono::DateTime<Utc>,
        started: Instant,
    ) -> ExecutionResult {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Err(ExecutionError::new(
                    ErrorKind::Timeout,
                    format!("Codex was terminated by signal {}", signal),
                ));
            }
        }

        if !status.success() {
            return Err(classify_exit(
                status.code(),
                &captured.combined_text(),
                self.adapter.install_hint(),
            ));
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let CapturedOutput {
            stdout, decoder, ..
        } = captured;

        match decoder {
            Some(decoder) => {
                let events = decoder.finish();
                let summary = events::summarize(&events);
                Ok(ExecutionSuccess {
                    events,
                    final_message: summary.final_message,
                    files_changed: summary.files_changed,
                    commands_run: summary.commands_run,
                    thread_id: summary.thread_id,
                    usage: summary.usage,
                    started_at,
                    duration_ms,
                })
            }
            None => Ok(ExecutionSuccess {
                events: Vec::new(),
                final_message: String::from_utf8_lossy(&stdout).trim().to_string(),
                files_changed: Vec::new(),
                commands_run: Vec::new(),
                thread_id: None,
                usage: None,
                started_at,
                duration_ms,
            }),
        }
    }

    fn spawn_error(&self, command: &ValidatedCommand, error: std::io::Error) -> ExecutionError {
        match error.kind() {
            std::io::ErrorKind::NotFound => ExecutionError::new(
                ErrorKind::NotFound,
                format!("Codex CLI not found at '{}'", command.program),
            )
            .with_details(self.adapter.install_hint()),
            std::io::ErrorKind::PermissionDenied => ExecutionError::new(
                ErrorKind::PermissionDenied,
                format!("Codex CLI at '{}' cannot be executed", command.program),
            )
            .with_details("Check that the binary is executable by the current user (chmod +x)."),
            _ => ExecutionError::new(ErrorKind::Unknown, "Failed to launch Codex")
                .with_details(error.to_string()),
        }
    }
}

fn spawn_child(command: &ValidatedCommand) -> std::io::Result<Child> {
    let mut process = Command::new(&command.program);
    process
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &command.cwd {
        process.current_dir(cwd);
    }
    for (key, value) in &command.env {
        process.env(key, value);
    }
    process.spawn()
}

async fn write_prompt(mut stdin: ChildStdin, prompt: Vec<u8>) -> std::io::Result<()> {
    stdin.write_all(&prompt).await?;
    stdin.shutdown().await
}

async fn pump_stream<R>(mut reader: R, stream: StreamKind, sender: mpsc::UnboundedSender<StreamChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0_u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(size) => {
                let chunk = StreamChunk {
                    stream,
                    bytes: buffer[..size].to_vec(),
                };
                if sender.send(chunk).is_err() {
                    break;
                }
            }
            Err(error) => {
                tracing::debug!(stream = stream.as_str(), error = %error, "codex stream read failed");
                break;
            }
        }
    }
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn join_writer(
    task: &mut Option<tokio::task::JoinHandle<std::io::Result<()>>>,
) -> Result<std::io::Result<()>, tokio::task::JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

/// Sends SIGTERM now and SIGKILL after `grace` if the child is still alive.
/// The escalation runs detached so the caller is not held up by it.
fn terminate_then_kill(mut child: Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    tokio::spawn(async move {
        if timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(grace_ms = grace.as_millis() as u64, "codex ignored SIGTERM; killing");
        let _ = child.start_kill();
        let _ = child.wait().await;
    });
}
