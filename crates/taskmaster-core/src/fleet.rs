//! Fleet: the `num_procs` workers that belong to one catalog
//! entry, and the operations that act across all of them at once.

use crate::signal::SignalPort;
use crate::spec::ProgramSpec;
use crate::worker::{Worker, WorkerSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Instances stagger their spawn by this much so a crash-looping program
/// doesn't fork-bomb the host the instant its fleet starts.
const SPAWN_STAGGER: Duration = Duration::from_millis(100);

/// Extra grace tacked onto a fleet's `stop_secs` when bounding a wait for
/// the whole fleet to reach `Stopped`.
const STOP_WAIT_GRACE: Duration = Duration::from_secs(2);

/// How often to re-poll worker snapshots while bounded-waiting.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Waits, once, for every worker in `workers` to reach `Stopped`, bounded
/// by a single `timeout` shared across the whole set rather than applied
/// per worker. Returns early as soon as all have stopped; a worker stuck
/// in `Fatal` or otherwise never reaching `Stopped` just runs out the
/// timeout alongside the rest.
async fn wait_all_stopped(workers: &[Worker], timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if workers
            .iter()
            .all(|w| w.snapshot().state == crate::worker::WorkerState::Stopped)
        {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            return;
        }
        sleep(STOP_POLL_INTERVAL).await;
    }
}

/// One catalog entry's full set of worker instances, all sharing the same
/// [`ProgramSpec`] at any point in time.
pub struct Fleet {
    name: String,
    spec: Arc<ProgramSpec>,
    workers: Vec<Worker>,
    signal_port: Arc<dyn SignalPort>,
}

impl Fleet {
    /// Builds a fleet of `spec.num_procs` idle workers. None are started.
    pub fn new(name: String, spec: Arc<ProgramSpec>, signal_port: Arc<dyn SignalPort>) -> Fleet {
        let workers = (0..spec.num_procs)
            .map(|index| Worker::spawn(name.clone(), index, spec.clone(), signal_port.clone()))
            .collect();

        Fleet {
            name,
            spec,
            workers,
            signal_port,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &Arc<ProgramSpec> {
        &self.spec
    }

    /// Starts every instance, staggering spawns by [`SPAWN_STAGGER`].
    pub async fn start_all(&self) {
        let mut first = true;
        for worker in &self.workers {
            if !first {
                sleep(SPAWN_STAGGER).await;
            }
            first = false;
            let _ = worker.start().await;
        }
    }

    /// Stops every instance. Does not wait for them serially — stop is
    /// itself graceful per-worker, so sequential issuance is cheap and
    /// keeps log ordering predictable.
    pub async fn stop_all(&self, force: bool) {
        for worker in &self.workers {
            worker.stop(force).await;
        }
    }

    /// Stops every instance, waits (bounded by `stop_secs` plus a small
    /// grace) for the whole fleet to actually reach `Stopped`, then starts
    /// again. Starting right after `stop_all` would race: `stop()` replies
    /// as soon as the worker enters `Stopping`, and `start()` delivered to
    /// a `Stopping` worker is a no-op.
    pub async fn restart_all(&self, force: bool) {
        self.stop_all(force).await;
        let timeout = Duration::from_secs(self.spec.stop_secs) + STOP_WAIT_GRACE;
        wait_all_stopped(&self.workers, timeout).await;
        self.start_all().await;
    }

    /// Status snapshots for every instance, ordered by index.
    pub fn status(&self) -> Vec<WorkerSnapshot> {
        self.workers.iter().map(Worker::snapshot).collect()
    }

    /// Applies a non-significant spec change in place: every worker picks
    /// up the new spec on its *next* spawn, with no restart of anything
    /// currently running.
    pub async fn update_spec_in_place(&mut self, spec: Arc<ProgramSpec>) {
        for worker in &self.workers {
            worker.update_spec(spec.clone()).await;
        }
        self.spec = spec;
    }

    /// Grows or shrinks the live worker set to `spec.num_procs`, leaving
    /// every surviving instance untouched — a `num_procs` change alone is
    /// not a significant change. On grow, only the newly appended slots
    /// are started; on shrink, the excess slots are force-stopped and
    /// disposed of.
    pub async fn reshape(&mut self, spec: Arc<ProgramSpec>) {
        let new_num_procs = spec.num_procs;
        for worker in &self.workers {
            worker.update_spec(spec.clone()).await;
        }

        match new_num_procs.cmp(&self.workers.len()) {
            std::cmp::Ordering::Greater => {
                let start_index = self.workers.len();
                for index in start_index..new_num_procs {
                    self.workers.push(Worker::spawn(
                        self.name.clone(),
                        index,
                        spec.clone(),
                        self.signal_port.clone(),
                    ));
                }
                let mut first = true;
                for worker in &self.workers[start_index..] {
                    if !first {
                        sleep(SPAWN_STAGGER).await;
                    }
                    first = false;
                    let _ = worker.start().await;
                }
            }
            std::cmp::Ordering::Less => {
                let removed = self.workers.split_off(new_num_procs);
                for worker in removed {
                    worker.stop(true).await;
                    worker.shutdown().await;
                }
            }
            std::cmp::Ordering::Equal => {}
        }

        self.spec = spec;
    }

    /// Tears down every worker and rebuilds the fleet against `spec`, for
    /// a significant change: command, stop signal/grace, working dir,
    /// umask, env, or log routing.
    pub async fn rebuild(self, spec: Arc<ProgramSpec>) -> Fleet {
        let signal_port = self.signal_port.clone();
        let was_running = self
            .workers
            .iter()
            .any(|w| !matches!(w.snapshot().state, crate::worker::WorkerState::Stopped));

        self.stop_all(true).await;
        for worker in self.workers {
            worker.shutdown().await;
        }

        let fleet = Fleet::new(self.name, spec, signal_port);
        if was_running {
            fleet.start_all().await;
        }
        fleet
    }

    /// Shuts every worker actor down, for supervisor-wide shutdown or a
    /// program's removal from the catalog on reload. Stops gracefully
    /// first, waits once (bounded by `stop_secs` plus a small grace) for
    /// the fleet to reach `Stopped`, then force-kills any stragglers
    /// before tearing down the actor tasks.
    pub async fn shutdown(self) {
        self.stop_all(false).await;
        let timeout = Duration::from_secs(self.spec.stop_secs) + STOP_WAIT_GRACE;
        wait_all_stopped(&self.workers, timeout).await;
        self.stop_all(true).await;
        for worker in self.workers {
            worker.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::NixSignalPort;
    use crate::spec::RestartPolicy;
    use crate::worker::WorkerState;
    use std::collections::{BTreeMap, HashSet};
    use std::path::PathBuf;

    fn spec_with_num_procs(num_procs: usize) -> Arc<ProgramSpec> {
        Arc::new(
            ProgramSpec {
                name: "t".to_string(),
                command: "/bin/sleep 5".to_string(),
                num_procs,
                autostart: false,
                restart_policy: RestartPolicy::Never,
                expected_exit_codes: HashSet::from([0]),
                start_retries: 0,
                start_secs: 1,
                stop_signal: crate::signal::SignalName::Term,
                stop_secs: 1,
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

    #[tokio::test]
    async fn growing_num_procs_leaves_existing_workers_running() {
        let spec = spec_with_num_procs(2);
        let mut fleet = Fleet::new("web".to_string(), spec, Arc::new(NixSignalPort));
        fleet.start_all().await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        fleet.reshape(spec_with_num_procs(4)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let statuses = fleet.status();
        assert_eq!(statuses.len(), 4);
        assert_eq!(statuses[0].state, WorkerState::Running);
        assert_eq!(statuses[1].state, WorkerState::Running);
        assert_eq!(statuses[0].restart_count, 0);
        assert_eq!(statuses[2].state, WorkerState::Running);
        assert_eq!(statuses[3].state, WorkerState::Running);

        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn shrinking_num_procs_disposes_excess_workers() {
        let spec = spec_with_num_procs(3);
        let mut fleet = Fleet::new("web".to_string(), spec, Arc::new(NixSignalPort));
        fleet.start_all().await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        fleet.reshape(spec_with_num_procs(1)).await;

        let statuses = fleet.status();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, WorkerState::Running);

        fleet.shutdown().await;
    }
}
