//! Worker session: one Python subprocess and its stdin/stdout pipe.
//!
//! # Protocol
//!
//! Calls and replies are JSON Lines records (see [`crate::codec`]). The pipe
//! carries no request identifiers: replies are matched to calls strictly by
//! order. A session therefore allows exactly one call in flight. Further
//! callers wait in FIFO order on a fair async mutex, and separate sessions
//! are needed for parallel work.
//!
//! # Lifecycle
//!
//! `Created → Ready → Busy → Ready → ... → Terminated`
//!
//! A session becomes `Terminated` on `quit()`, when the worker exits or its
//! pipe breaks, when a call times out, or when a caller drops an in-flight
//! call. Once terminated, every call fails with
//! [`BridgeError::WorkerCrashed`]; a new session has to be created.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, warn};

use super::pipe::FramedPipe;
use crate::codec::{self, BridgeCall, BridgeReply, QUIT_METHOD};
use crate::config::SessionConfig;
use crate::error::{BridgeError, Result};

type WorkerPipe = FramedPipe<ChildStdin, BufReader<ChildStdout>>;

/// Lifecycle state of a worker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, no process yet
    Created,
    /// Process running and idle
    Ready,
    /// A call is in flight
    Busy,
    /// Process gone or abandoned; the session cannot be reused
    Terminated,
}

#[derive(Debug)]
struct StateCell(Mutex<SessionState>);

impl StateCell {
    fn get(&self) -> SessionState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, next: SessionState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn replace(&self, next: SessionState) -> SessionState {
        std::mem::replace(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner), next)
    }

    /// Move to `next` unless already terminated.
    fn advance(&self, next: SessionState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Terminated {
            return false;
        }
        *state = next;
        true
    }
}

/// Marks the session terminated if dropped before the reply was read.
struct InFlight<'a> {
    state: &'a StateCell,
    method: &'a str,
    landed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.landed {
            self.state.set(SessionState::Terminated);
            warn!(method = self.method, "Call abandoned mid-flight, session terminated");
        }
    }
}

/// Counts a caller as pending from queueing until its call returns.
struct PendingTicket<'a>(&'a AtomicUsize);

impl<'a> PendingTicket<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owning handle over one worker subprocess and its pipe.
pub struct WorkerSession {
    config: SessionConfig,
    state: StateCell,
    /// Lock order: `pipe` before `child`.
    pipe: TokioMutex<Option<WorkerPipe>>,
    child: TokioMutex<Option<Child>>,
    pending: AtomicUsize,
    pid: AtomicU32,
}

impl WorkerSession {
    /// Create a session in the `Created` state. No process is spawned yet.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: StateCell(Mutex::new(SessionState::Created)),
            pipe: TokioMutex::new(None),
            child: TokioMutex::new(None),
            pending: AtomicUsize::new(0),
            pid: AtomicU32::new(0),
        }
    }

    /// Create a session and start its worker.
    pub async fn spawn(config: SessionConfig) -> Result<Self> {
        let session = Self::new(config);
        session.start().await?;
        Ok(session)
    }

    /// Spawn the worker process and wire its stdin/stdout as the call pipe.
    ///
    /// Starting a running session is a no-op; starting a terminated one fails.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The isolated environment does not exist (the session stays `Created`)
    /// - The program cannot be launched (`BridgeError::Spawn`)
    /// - The session was already terminated (`BridgeError::WorkerCrashed`)
    pub async fn start(&self) -> Result<()> {
        let mut pipe_slot = self.pipe.lock().await;
        let mut child_slot = self.child.lock().await;

        match self.state.get() {
            SessionState::Created => {}
            SessionState::Ready | SessionState::Busy => return Ok(()),
            SessionState::Terminated => {
                return Err(BridgeError::WorkerCrashed("session already terminated".into()))
            }
        }

        let program = self.config.environment.as_ref().map_or_else(
            || self.config.program.clone(),
            |env| env.resolve_program(&self.config.program),
        );

        info!(program = %program.display(), args = ?self.config.args, "Starting worker process");

        let mut command = Command::new(&program);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(self.config.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true); // Ensure cleanup if the session is dropped

        // Applied last so extra variables cannot undo the isolation
        if let Some(environment) = &self.config.environment {
            environment.apply_to(&mut command)?;
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(program = %program.display(), error = %e, "Failed to spawn worker process");
                self.state.set(SessionState::Terminated);
                return Err(BridgeError::Spawn(e));
            }
        };

        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            self.state.set(SessionState::Terminated);
            return Err(BridgeError::WorkerCrashed("worker pipes unavailable".into()));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, pid));
        }

        *pipe_slot = Some(FramedPipe::new(
            stdin,
            BufReader::new(stdout),
            self.config.max_frame_bytes,
        ));
        *child_slot = Some(child);
        self.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
        self.state.set(SessionState::Ready);

        info!(pid = ?pid, "Worker session ready");
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Process ID of the worker while it is owned by this session.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Calls queued or in flight.
    pub fn pending_calls(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Check if the worker process is still running.
    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    /// Issue one call and wait for its reply, queueing behind earlier calls.
    ///
    /// Uses the configured call timeout when there is one.
    ///
    /// # Errors
    ///
    /// `BridgeError::Remote` when the worker reports a failure and
    /// `BridgeError::Codec` for an unreadable reply; the session stays usable
    /// after both. `WorkerCrashed` and `Timeout` leave it terminated.
    pub async fn invoke(&self, call: &BridgeCall) -> Result<Value> {
        match self.config.call_timeout {
            Some(timeout) => self.invoke_with_timeout(call, timeout).await,
            None => self.queued_call(call).await,
        }
    }

    /// Issue one call with a deadline covering queueing and the reply.
    ///
    /// On expiry the session is terminated: a late reply would otherwise be
    /// paired with the next call.
    ///
    /// # Arguments
    ///
    /// * `call` - The call to send
    /// * `timeout` - Maximum time to wait, including time spent queued
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Timeout` if no reply arrives in time, otherwise
    /// the same errors as [`Self::invoke`].
    pub async fn invoke_with_timeout(&self, call: &BridgeCall, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, self.queued_call(call)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    method = call.method(),
                    timeout_ms = timeout.as_millis(),
                    "Bridge call timed out, terminating session"
                );
                if let Ok(mut slot) = self.pipe.try_lock() {
                    *slot = None;
                }
                self.terminate().await;
                Err(BridgeError::Timeout(timeout))
            }
        }
    }

    /// Issue one call only if the session is idle.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::WorkerBusy` without sending anything if a call
    /// is in flight or queued, otherwise the same errors as [`Self::invoke`].
    pub async fn try_invoke(&self, call: &BridgeCall) -> Result<Value> {
        let frame = codec::encode_call(call)?;
        if self.pending_calls() > 0 {
            return Err(BridgeError::WorkerBusy);
        }
        let mut slot = self.pipe.try_lock().map_err(|_| BridgeError::WorkerBusy)?;
        let _ticket = PendingTicket::new(&self.pending);
        self.exchange(&mut slot, call.method(), &frame).await
    }

    /// Ask the worker to exit, kill it after the grace period, and mark the
    /// session terminated. Calling it again is a no-op.
    ///
    /// With a call in flight the worker is killed immediately and that call
    /// fails with [`BridgeError::WorkerCrashed`].
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; failures to signal or reap the worker
    /// are logged.
    pub async fn quit(&self) -> Result<()> {
        let previous = self.state.replace(SessionState::Terminated);
        if previous == SessionState::Created {
            debug!("Quit before start");
            return Ok(());
        }

        let mut polite = false;
        if let Ok(mut slot) = self.pipe.try_lock() {
            if let Some(mut pipe) = slot.take() {
                if previous == SessionState::Ready {
                    polite = send_quit(&mut pipe).await;
                }
                // Dropping the pipe closes the worker's stdin
            }
        }

        let child = self.child.lock().await.take();
        self.pid.store(0, Ordering::SeqCst);
        let Some(mut child) = child else {
            debug!("Worker already gone");
            return Ok(());
        };
        let pid = child.id();

        if polite {
            match tokio::time::timeout(self.config.quit_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(pid = ?pid, %status, "Worker exited");
                    return Ok(());
                }
                Ok(Err(e)) => warn!(pid = ?pid, error = %e, "Failed to wait for worker exit"),
                Err(_) => warn!(
                    pid = ?pid,
                    grace_ms = self.config.quit_grace.as_millis(),
                    "Worker ignored quit, killing"
                ),
            }
        }

        match child.kill().await {
            Ok(()) => info!(pid = ?pid, "Worker killed"),
            Err(e) => warn!(pid = ?pid, error = %e, "Error during worker shutdown"),
        }
        Ok(())
    }

    async fn queued_call(&self, call: &BridgeCall) -> Result<Value> {
        let frame = codec::encode_call(call)?;
        let _ticket = PendingTicket::new(&self.pending);
        let mut slot = self.pipe.lock().await;
        self.exchange(&mut slot, call.method(), &frame).await
    }

    async fn exchange(
        &self,
        slot: &mut Option<WorkerPipe>,
        method: &str,
        frame: &[u8],
    ) -> Result<Value> {
        let Some(pipe) = slot.as_mut() else {
            return Err(match self.state.get() {
                SessionState::Created => BridgeError::NotStarted,
                _ => BridgeError::WorkerCrashed("worker session terminated".into()),
            });
        };
        if !self.state.advance(SessionState::Busy) {
            *slot = None;
            return Err(BridgeError::WorkerCrashed("worker session terminated".into()));
        }

        let mut flight = InFlight {
            state: &self.state,
            method,
            landed: false,
        };
        let started = Instant::now();
        debug!(method, "Sending bridge call");

        let outcome = pipe.round_trip(frame).await;
        flight.landed = true;

        match outcome {
            Ok(reply) => {
                self.state.advance(SessionState::Ready);
                debug!(
                    method,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Bridge call completed"
                );
                match reply {
                    BridgeReply::Ok(payload) => Ok(payload),
                    BridgeReply::Failed(message) => {
                        warn!(method, error = %message, "Worker reported failure");
                        Err(BridgeError::Remote {
                            method: method.to_string(),
                            message,
                        })
                    }
                }
            }
            Err(err) if err.is_fatal() => {
                error!(method, error = %err, "Worker pipe failed, terminating session");
                *slot = None;
                self.terminate().await;
                Err(err)
            }
            Err(err) => {
                self.state.advance(SessionState::Ready);
                Err(err)
            }
        }
    }

    /// Mark terminated and reap or kill the process.
    async fn terminate(&self) {
        self.state.set(SessionState::Terminated);
        self.pid.store(0, Ordering::SeqCst);

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => info!(%status, "Worker exited"),
            _ => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill worker");
                }
            }
        }
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        if self.state.get() == SessionState::Terminated {
            return;
        }
        let pid = self.pid();
        if let Some(child) = self.child.get_mut().as_mut() {
            warn!(pid = ?pid, "WorkerSession dropped without quit, killing worker");
            if let Err(e) = child.start_kill() {
                debug!(pid = ?pid, error = %e, "Worker already gone");
            }
        }
    }
}

async fn send_quit(pipe: &mut WorkerPipe) -> bool {
    let frame = match codec::encode_call(&BridgeCall::new(QUIT_METHOD)) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "Could not encode quit command");
            return false;
        }
    };
    match pipe.send_frame(&frame).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "Could not deliver quit command");
            false
        }
    }
}

/// Relay the worker's stderr into tracing, one event per line.
async fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "facenet_bridge::worker", pid = ?pid, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(pid = ?pid, error = %e, "Worker stderr closed");
                break;
            }
        }
    }
}
