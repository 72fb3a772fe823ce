//! Worker: one supervised OS process slot and its state
//! machine, start-confirmation timer, backoff/exit-reaction loop, and I/O
//! pumps.
//!
//! Each Worker is its own actor: a dedicated task owns the `Child` handle
//! and drives every transition; callers talk to it over a small command
//! channel with oneshot replies, the same shape the mereblocks-style
//! per-program thread uses, generalized with timers and richer states.

use crate::error::CoreError;
use crate::signal::SignalPort;
use crate::spec::ProgramSpec;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// States in the worker's transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Backoff,
    Fatal,
}

/// Point-in-time view of a worker, returned by `status()` calls.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub index: usize,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub started_at: Option<Instant>,
    /// Wall-clock stamp of the same spawn, for surfaces (HTTP JSON) that
    /// need a timestamp rather than a monotonic instant.
    pub started_at_wall: Option<chrono::DateTime<chrono::Utc>>,
    pub restart_count: u32,
    pub stop_requested: bool,
}

impl WorkerSnapshot {
    fn new(index: usize) -> Self {
        WorkerSnapshot {
            index,
            pid: None,
            state: WorkerState::Stopped,
            started_at: None,
            started_at_wall: None,
            restart_count: 0,
            stop_requested: false,
        }
    }

    /// Wall-clock time the process has been alive, when running.
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }
}

enum WorkerCommand {
    Start(oneshot::Sender<Result<bool, CoreError>>),
    Stop {
        force: bool,
        reply: oneshot::Sender<bool>,
    },
    UpdateSpec(Arc<ProgramSpec>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running Worker actor. Cheap to clone-by-reference (held by
/// the owning Fleet); dropping the handle does not stop the worker — use
/// [`Worker::shutdown`] for that.
pub struct Worker {
    cmd_tx: mpsc::Sender<WorkerCommand>,
    snapshot: Arc<Mutex<WorkerSnapshot>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Worker {
    /// Spawns the worker actor task for instance `index` of `program`.
    /// The OS process itself is not started until [`Worker::start`] is
    /// called.
    pub fn spawn(
        program: String,
        index: usize,
        spec: Arc<ProgramSpec>,
        signal_port: Arc<dyn SignalPort>,
    ) -> Worker {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let snapshot = Arc::new(Mutex::new(WorkerSnapshot::new(index)));
        let task_snapshot = snapshot.clone();
        let task = tokio::spawn(run(program, index, spec, signal_port, task_snapshot, cmd_rx));

        Worker {
            cmd_tx,
            snapshot,
            task: Some(task),
        }
    }

    /// `start()`: returns `Ok(true)` if a spawn was initiated, `Ok(false)`
    /// if the worker was already Starting/Running/Backoff (AlreadyInState,
    /// not treated as an error).
    pub async fn start(&self) -> Result<bool, CoreError> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(WorkerCommand::Start(reply)).await.is_err() {
            return Ok(false);
        }
        rx.await.unwrap_or(Ok(false))
    }

    /// `stop(force)`: returns `true` if a stop was actually initiated.
    pub async fn stop(&self, force: bool) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(WorkerCommand::Stop { force, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Replaces the spec used for the worker's *next* spawn. Does not
    /// affect an already-running child.
    pub async fn update_spec(&self, spec: Arc<ProgramSpec>) {
        let _ = self.cmd_tx.send(WorkerCommand::UpdateSpec(spec)).await;
    }

    /// Current state snapshot; never blocks on the actor task.
    pub fn snapshot(&self) -> WorkerSnapshot {
        self.snapshot.lock().expect("worker snapshot mutex poisoned").clone()
    }

    /// Tears the worker down: force-kills any live child and ends the
    /// actor task. Consumes `self`.
    pub async fn shutdown(mut self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(WorkerCommand::Shutdown(reply)).await.is_ok() {
            let _ = rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Outcome of reacting to a child exit.
enum ExitReaction {
    Stopped,
    Backoff { delay: Duration, restart_count: u32 },
    Fatal,
}

fn react_to_exit(spec: &ProgramSpec, exit_code: Option<i32>, restart_count: u32) -> ExitReaction {
    if !spec.should_restart(exit_code) {
        return ExitReaction::Stopped;
    }
    if restart_count < spec.start_retries {
        let restart_count = restart_count + 1;
        ExitReaction::Backoff {
            delay: ProgramSpec::backoff_duration(restart_count),
            restart_count,
        }
    } else {
        ExitReaction::Fatal
    }
}

fn set_snapshot(snapshot: &Arc<Mutex<WorkerSnapshot>>, f: impl FnOnce(&mut WorkerSnapshot)) {
    let mut guard = snapshot.lock().expect("worker snapshot mutex poisoned");
    f(&mut guard);
}

/// The worker actor loop: owns `child` and drives every state transition.
/// Commands interrupt in-flight timers immediately (`tokio::select!`
/// against `cmd_rx`), so every wait stays cancellable without ever
/// blocking an OS thread.
async fn run(
    program: String,
    index: usize,
    mut spec: Arc<ProgramSpec>,
    signal_port: Arc<dyn SignalPort>,
    snapshot: Arc<Mutex<WorkerSnapshot>>,
    mut cmd_rx: mpsc::Receiver<WorkerCommand>,
) {
    let mut state = WorkerState::Stopped;
    let mut child: Option<Child> = None;
    let mut restart_count: u32 = 0;

    loop {
        match state {
            WorkerState::Stopped | WorkerState::Fatal => {
                let was_fatal = state == WorkerState::Fatal;
                match cmd_rx.recv().await {
                    None => return,
                    Some(WorkerCommand::Shutdown(reply)) => {
                        let _ = reply.send(());
                        return;
                    }
                    Some(WorkerCommand::UpdateSpec(s)) => spec = s,
                    Some(WorkerCommand::Stop { reply, .. }) => {
                        let _ = reply.send(false);
                    }
                    Some(WorkerCommand::Start(reply)) => {
                        if was_fatal {
                            restart_count = 0;
                        }
                        match spawn_child(&program, index, &spec).await {
                            Ok(c) => {
                                let pid = c.id();
                                child = Some(c);
                                state = WorkerState::Starting;
                                let started_at = Instant::now();
                                let started_at_wall = chrono::Utc::now();
                                set_snapshot(&snapshot, |s| {
                                    s.state = state;
                                    s.pid = pid;
                                    s.started_at = Some(started_at);
                                    s.started_at_wall = Some(started_at_wall);
                                    s.stop_requested = false;
                                    s.restart_count = restart_count;
                                });
                                info!(program = %program, index, pid, "spawned");
                                let _ = reply.send(Ok(true));
                            }
                            Err(e) => {
                                state = WorkerState::Fatal;
                                set_snapshot(&snapshot, |s| {
                                    s.state = state;
                                    s.pid = None;
                                });
                                warn!(program = %program, index, error = %e, "spawn failed");
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                }
            }

            WorkerState::Starting => {
                let confirm = sleep(Duration::from_secs(spec.start_secs));
                tokio::pin!(confirm);
                let c = child.as_mut().expect("Starting state always has a child");

                tokio::select! {
                    biased;

                    status = c.wait() => {
                        let exit_code = status.ok().and_then(|s| s.code());
                        child = None;
                        state = apply_exit_reaction(&spec, exit_code, &mut restart_count, &snapshot);
                    }
                    _ = &mut confirm => {
                        state = WorkerState::Running;
                        restart_count = 0;
                        set_snapshot(&snapshot, |s| {
                            s.state = state;
                            s.restart_count = 0;
                        });
                        debug!(program = %program, index, "confirmed running");
                    }
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            None => { kill_child(&mut child).await; return; }
                            Some(WorkerCommand::Shutdown(reply)) => {
                                kill_child(&mut child).await;
                                let _ = reply.send(());
                                return;
                            }
                            Some(WorkerCommand::UpdateSpec(s)) => spec = s,
                            Some(WorkerCommand::Start(reply)) => { let _ = reply.send(Ok(false)); }
                            Some(WorkerCommand::Stop{ force, reply }) => {
                                initiate_stop(&program, index, &spec, &signal_port, child.as_ref(), force).await;
                                state = WorkerState::Stopping;
                                set_snapshot(&snapshot, |s| { s.state = state; s.stop_requested = true; });
                                let _ = reply.send(true);
                            }
                        }
                    }
                }
            }

            WorkerState::Running => {
                let c = child.as_mut().expect("Running state always has a child");
                tokio::select! {
                    status = c.wait() => {
                        let exit_code = status.ok().and_then(|s| s.code());
                        child = None;
                        state = apply_exit_reaction(&spec, exit_code, &mut restart_count, &snapshot);
                    }
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            None => { kill_child(&mut child).await; return; }
                            Some(WorkerCommand::Shutdown(reply)) => {
                                kill_child(&mut child).await;
                                let _ = reply.send(());
                                return;
                            }
                            Some(WorkerCommand::UpdateSpec(s)) => spec = s,
                            Some(WorkerCommand::Start(reply)) => { let _ = reply.send(Ok(false)); }
                            Some(WorkerCommand::Stop{ force, reply }) => {
                                initiate_stop(&program, index, &spec, &signal_port, child.as_ref(), force).await;
                                state = WorkerState::Stopping;
                                set_snapshot(&snapshot, |s| { s.state = state; s.stop_requested = true; });
                                let _ = reply.send(true);
                            }
                        }
                    }
                }
            }

            WorkerState::Stopping => {
                let grace = sleep(Duration::from_secs(spec.stop_secs));
                tokio::pin!(grace);
                let pid = child.as_ref().and_then(|c| c.id());
                let c = child.as_mut().expect("Stopping state always has a child");

                tokio::select! {
                    _ = c.wait() => {
                        child = None;
                        state = WorkerState::Stopped;
                        set_snapshot(&snapshot, |s| { s.state = state; s.pid = None; });
                        info!(program = %program, index, "stopped");
                    }
                    _ = &mut grace => {
                        if let Some(pid) = pid {
                            if !signal_port.force_kill(pid) {
                                warn!(program = %program, index, pid, "force-kill failed");
                            }
                        }
                        if let Some(c) = child.as_mut() {
                            let _ = c.wait().await;
                        }
                        child = None;
                        state = WorkerState::Stopped;
                        set_snapshot(&snapshot, |s| { s.state = state; s.pid = None; });
                        info!(program = %program, index, "escalated to force-kill");
                    }
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            None => { kill_child(&mut child).await; return; }
                            Some(WorkerCommand::Shutdown(reply)) => {
                                kill_child(&mut child).await;
                                let _ = reply.send(());
                                return;
                            }
                            Some(WorkerCommand::UpdateSpec(s)) => spec = s,
                            Some(WorkerCommand::Start(reply)) => { let _ = reply.send(Ok(false)); }
                            Some(WorkerCommand::Stop{ force, reply }) => {
                                if force {
                                    if let Some(pid) = pid {
                                        let _ = signal_port.force_kill(pid);
                                    }
                                }
                                let _ = reply.send(false);
                            }
                        }
                    }
                }
            }

            WorkerState::Backoff => {
                let delay = sleep(ProgramSpec::backoff_duration(restart_count));
                tokio::pin!(delay);
                tokio::select! {
                    _ = &mut delay => {
                        match spawn_child(&program, index, &spec).await {
                            Ok(c) => {
                                let pid = c.id();
                                child = Some(c);
                                state = WorkerState::Starting;
                                let started_at = Instant::now();
                                let started_at_wall = chrono::Utc::now();
                                set_snapshot(&snapshot, |s| {
                                    s.state = state;
                                    s.pid = pid;
                                    s.started_at = Some(started_at);
                                    s.started_at_wall = Some(started_at_wall);
                                });
                                info!(program = %program, index, pid, "respawned after backoff");
                            }
                            Err(e) => {
                                state = WorkerState::Fatal;
                                set_snapshot(&snapshot, |s| { s.state = state; s.pid = None; });
                                warn!(program = %program, index, error = %e, "respawn failed");
                            }
                        }
                    }
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            None => return,
                            Some(WorkerCommand::Shutdown(reply)) => {
                                let _ = reply.send(());
                                return;
                            }
                            Some(WorkerCommand::UpdateSpec(s)) => spec = s,
                            Some(WorkerCommand::Start(reply)) => { let _ = reply.send(Ok(false)); }
                            Some(WorkerCommand::Stop{ reply, .. }) => {
                                state = WorkerState::Stopped;
                                set_snapshot(&snapshot, |s| { s.state = state; s.stop_requested = true; });
                                let _ = reply.send(true);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn apply_exit_reaction(
    spec: &ProgramSpec,
    exit_code: Option<i32>,
    restart_count: &mut u32,
    snapshot: &Arc<Mutex<WorkerSnapshot>>,
) -> WorkerState {
    match react_to_exit(spec, exit_code, *restart_count) {
        ExitReaction::Stopped => {
            set_snapshot(snapshot, |s| {
                s.state = WorkerState::Stopped;
                s.pid = None;
            });
            WorkerState::Stopped
        }
        ExitReaction::Backoff {
            delay: _,
            restart_count: new_count,
        } => {
            *restart_count = new_count;
            set_snapshot(snapshot, |s| {
                s.state = WorkerState::Backoff;
                s.pid = None;
                s.restart_count = new_count;
            });
            WorkerState::Backoff
        }
        ExitReaction::Fatal => {
            set_snapshot(snapshot, |s| {
                s.state = WorkerState::Fatal;
                s.pid = None;
            });
            WorkerState::Fatal
        }
    }
}

async fn initiate_stop(
    program: &str,
    index: usize,
    spec: &ProgramSpec,
    signal_port: &Arc<dyn SignalPort>,
    child: Option<&Child>,
    force: bool,
) {
    let Some(pid) = child.and_then(|c| c.id()) else {
        return;
    };
    let sent = if force {
        signal_port.force_kill(pid)
    } else {
        signal_port.send(pid, spec.stop_signal)
    };
    if !sent {
        warn!(program = %program, index, pid, force, "signal send failed, will escalate at grace deadline");
    }
}

async fn kill_child(child: &mut Option<Child>) {
    if let Some(c) = child.as_mut() {
        let _ = c.start_kill();
        let _ = c.wait().await;
    }
    *child = None;
}

/// Builds and spawns the OS process for one worker instance: pre-exec
/// umask, working directory, augmented environment, piped stdio with
/// background pump tasks.
async fn spawn_child(program: &str, index: usize, spec: &ProgramSpec) -> Result<Child, CoreError> {
    let (exe, args) = spec.argv();
    let mut command = TokioCommand::new(&exe);
    command
        .args(&args)
        .current_dir(&spec.working_dir)
        .envs(&spec.env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let umask = spec.umask;
        // SAFETY: the closure only calls async-signal-safe libc::umask
        // between fork and exec.
        unsafe {
            command.as_std_mut().pre_exec(move || {
                libc::umask(umask as libc::mode_t);
                Ok(())
            });
        }
    }

    let mut child = command
        .spawn()
        .map_err(|source| CoreError::SpawnFailed {
            program: program.to_string(),
            index,
            source,
        })?;

    spawn_pump(
        program.to_string(),
        index,
        "stdout",
        child.stdout.take(),
        spec.stdout_path_for(index),
        spec.discard_output,
    );
    spawn_pump(
        program.to_string(),
        index,
        "stderr",
        child.stderr.take(),
        spec.stderr_path_for(index),
        spec.discard_output,
    );

    Ok(child)
}

/// Independent task that reads lines from a child's stdout/stderr pipe and
/// appends them to the configured sink (or drops them). Never blocks
/// worker supervision.
fn spawn_pump<R>(
    program: String,
    index: usize,
    stream_name: &'static str,
    pipe: Option<R>,
    sink_path: Option<PathBuf>,
    discard: bool,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else { return };

    tokio::spawn(async move {
        let mut sink = if discard {
            None
        } else if let Some(path) = sink_path {
            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    warn!(program = %program, index, error = %e, "failed to create log directory");
                }
            }
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(program = %program, index, error = %e, "failed to open log sink");
                    None
                }
            }
        } else {
            None
        };

        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(file) = sink.as_mut() {
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            warn!(program = %program, index, stream = stream_name, error = %e, "log sink write failed");
                        } else {
                            let _ = file.write_all(b"\n").await;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(program = %program, index, stream = stream_name, error = %e, "log pump read failed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::NixSignalPort;
    use crate::spec::RestartPolicy;
    use std::collections::{BTreeMap, HashSet};
    use std::time::Duration as StdDuration;

    fn spec_with(command: &str, restart_policy: RestartPolicy, start_retries: u32) -> Arc<ProgramSpec> {
        Arc::new(
            ProgramSpec {
                name: "t".to_string(),
                command: command.to_string(),
                num_procs: 1,
                autostart: false,
                restart_policy,
                expected_exit_codes: HashSet::from([0]),
                start_retries,
                start_secs: 1,
                stop_signal: crate::signal::SignalName::Term,
                stop_secs: 2,
                working_dir: PathBuf::from("/"),
                umask: 0o022,
                env: BTreeMap::new(),
                stdout_path: None,
                stderr_path: None,
                discard_output: true,
            }
            .validated()
            .unwrap(),
        )
    }

    async fn wait_for(worker: &Worker, target: WorkerState, attempts: u32) -> WorkerState {
        for _ in 0..attempts {
            let s = worker.snapshot().state;
            if s == target {
                return s;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        worker.snapshot().state
    }

    #[tokio::test]
    async fn expected_exit_goes_to_stopped_without_restart() {
        let spec = spec_with("/bin/true", RestartPolicy::OnUnexpected, 2);
        let worker = Worker::spawn("t".into(), 0, spec, Arc::new(NixSignalPort));
        assert!(worker.start().await.unwrap());
        let state = wait_for(&worker, WorkerState::Stopped, 100).await;
        assert_eq!(state, WorkerState::Stopped);
        assert_eq!(worker.snapshot().restart_count, 0);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn unexpected_exit_exhausts_retries_into_fatal() {
        let spec = spec_with("/bin/false", RestartPolicy::OnUnexpected, 2);
        let worker = Worker::spawn("t".into(), 0, spec, Arc::new(NixSignalPort));
        assert!(worker.start().await.unwrap());
        let state = wait_for(&worker, WorkerState::Fatal, 300).await;
        assert_eq!(state, WorkerState::Fatal);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn already_running_start_is_a_no_op() {
        let spec = spec_with("/bin/sleep 5", RestartPolicy::Never, 0);
        let worker = Worker::spawn("t".into(), 0, spec, Arc::new(NixSignalPort));
        assert!(worker.start().await.unwrap());
        wait_for(&worker, WorkerState::Running, 200).await;
        assert!(!worker.start().await.unwrap());
        worker.stop(true).await;
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn stop_twice_is_idempotent() {
        let spec = spec_with("/bin/sleep 5", RestartPolicy::Never, 0);
        let worker = Worker::spawn("t".into(), 0, spec, Arc::new(NixSignalPort));
        worker.start().await.unwrap();
        wait_for(&worker, WorkerState::Running, 200).await;
        assert!(worker.stop(false).await);
        wait_for(&worker, WorkerState::Stopped, 300).await;
        assert!(!worker.stop(false).await);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn forced_stop_kills_immediately() {
        let spec = spec_with("/bin/sleep 30", RestartPolicy::Never, 0);
        let worker = Worker::spawn("t".into(), 0, spec, Arc::new(NixSignalPort));
        worker.start().await.unwrap();
        wait_for(&worker, WorkerState::Running, 200).await;
        worker.stop(true).await;
        let state = wait_for(&worker, WorkerState::Stopped, 200).await;
        assert_eq!(state, WorkerState::Stopped);
        worker.shutdown().await;
    }
}
