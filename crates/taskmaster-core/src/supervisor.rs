//! Supervisor: the control façade that owns every Fleet
//! and the reload reconciliation algorithm.
//!
//! Every public operation here is a single mutually-exclusive critical
//! section over the whole catalog, held as a `tokio::sync::Mutex` for the
//! operation's entire duration — including any timers it waits on. Because
//! it is an async mutex, holding it across an `.await` suspends only the
//! calling task, never an OS thread, so unrelated worker I/O pumps and
//! exit reapers keep making progress while one command is in flight.
//! `reload` is the one operation that deliberately holds the lock across
//! its full reconciliation, for atomicity against concurrent commands.

use crate::error::{CoreError, CoreResult};
use crate::fleet::Fleet;
use crate::signal::SignalPort;
use crate::spec::ProgramSpec;
use crate::worker::WorkerSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Status line for one program's fleet, as returned by [`Supervisor::status`].
pub struct ProgramStatus {
    pub name: String,
    pub workers: Vec<WorkerSnapshot>,
}

/// Outcome of one `reload()` call, broken down into
/// Removed/Changed/Unchanged/New categories. Used for logging and for
/// the REPL/HTTP reload acknowledgement.
#[derive(Debug, Default, Clone)]
pub struct ReloadReport {
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
    pub added: Vec<String>,
}

/// Owns the entire program catalog and every Fleet in it.
pub struct Supervisor {
    catalog: Mutex<HashMap<String, Fleet>>,
    signal_port: Arc<dyn SignalPort>,
}

impl Supervisor {
    pub fn new(signal_port: Arc<dyn SignalPort>) -> Supervisor {
        Supervisor {
            catalog: Mutex::new(HashMap::new()),
            signal_port,
        }
    }

    /// Initial boot: builds a Fleet for every
    /// program in `specs` and starts the ones with `autostart = true`.
    pub async fn boot(&self, specs: HashMap<String, ProgramSpec>) {
        let mut catalog = self.catalog.lock().await;
        for (name, spec) in specs {
            let autostart = spec.autostart;
            let fleet = Fleet::new(name.clone(), Arc::new(spec), self.signal_port.clone());
            if autostart {
                fleet.start_all().await;
            }
            catalog.insert(name, fleet);
        }
    }

    pub async fn start(&self, name: &str) -> CoreResult<()> {
        let catalog = self.catalog.lock().await;
        let fleet = catalog
            .get(name)
            .ok_or_else(|| CoreError::UnknownProgram { name: name.to_string() })?;
        fleet.start_all().await;
        Ok(())
    }

    pub async fn stop(&self, name: &str, force: bool) -> CoreResult<()> {
        let catalog = self.catalog.lock().await;
        let fleet = catalog
            .get(name)
            .ok_or_else(|| CoreError::UnknownProgram { name: name.to_string() })?;
        fleet.stop_all(force).await;
        Ok(())
    }

    pub async fn restart(&self, name: &str, force: bool) -> CoreResult<()> {
        let catalog = self.catalog.lock().await;
        let fleet = catalog
            .get(name)
            .ok_or_else(|| CoreError::UnknownProgram { name: name.to_string() })?;
        fleet.restart_all(force).await;
        Ok(())
    }

    pub async fn start_all(&self) {
        let catalog = self.catalog.lock().await;
        for fleet in catalog.values() {
            fleet.start_all().await;
        }
    }

    pub async fn stop_all(&self, force: bool) {
        let catalog = self.catalog.lock().await;
        for fleet in catalog.values() {
            fleet.stop_all(force).await;
        }
    }

    pub async fn restart_all(&self, force: bool) {
        let catalog = self.catalog.lock().await;
        for fleet in catalog.values() {
            fleet.restart_all(force).await;
        }
    }

    /// Status for one named program, or every program when `name` is
    /// `None`. Results are sorted by name for stable REPL/HTTP output.
    pub async fn status(&self, name: Option<&str>) -> CoreResult<Vec<ProgramStatus>> {
        let catalog = self.catalog.lock().await;

        if let Some(name) = name {
            let fleet = catalog
                .get(name)
                .ok_or_else(|| CoreError::UnknownProgram { name: name.to_string() })?;
            return Ok(vec![ProgramStatus {
                name: fleet.name().to_string(),
                workers: fleet.status(),
            }]);
        }

        let mut statuses: Vec<ProgramStatus> = catalog
            .values()
            .map(|fleet| ProgramStatus {
                name: fleet.name().to_string(),
                workers: fleet.status(),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(statuses)
    }

    /// Returns the effective spec for one program, for the `config <name>`
    /// introspection command.
    pub async fn config(&self, name: &str) -> CoreResult<Arc<ProgramSpec>> {
        let catalog = self.catalog.lock().await;
        catalog
            .get(name)
            .map(|f| f.spec().clone())
            .ok_or_else(|| CoreError::UnknownProgram { name: name.to_string() })
    }

    /// Sends an arbitrary signal to every instance of a program, bypassing
    /// the normal stop grace period (used by the REPL/socket `signal`
    /// command).
    pub async fn signal(&self, name: &str, signal: crate::signal::SignalName) -> CoreResult<()> {
        let catalog = self.catalog.lock().await;
        let fleet = catalog
            .get(name)
            .ok_or_else(|| CoreError::UnknownProgram { name: name.to_string() })?;
        for snapshot in fleet.status() {
            if let Some(pid) = snapshot.pid {
                if !self.signal_port.send(pid, signal) {
                    return Err(CoreError::SignalFailed {
                        program: name.to_string(),
                        index: snapshot.index,
                        pid,
                    });
                }
            }
        }
        Ok(())
    }

    /// Reload: reconciles the live catalog against a freshly
    /// parsed one. Held as a single critical section for atomicity, so no
    /// other command observes a partially-reconciled catalog.
    pub async fn reload(&self, new_specs: HashMap<String, ProgramSpec>) -> ReloadReport {
        let mut catalog = self.catalog.lock().await;
        let mut report = ReloadReport::default();

        let removed_names: Vec<String> = catalog
            .keys()
            .filter(|name| !new_specs.contains_key(*name))
            .cloned()
            .collect();

        for name in removed_names {
            if let Some(fleet) = catalog.remove(&name) {
                fleet.shutdown().await;
            }
            report.removed.push(name);
        }

        for (name, new_spec) in new_specs {
            match catalog.remove(&name) {
                None => {
                    let autostart = new_spec.autostart;
                    let fleet = Fleet::new(name.clone(), Arc::new(new_spec), self.signal_port.clone());
                    if autostart {
                        fleet.start_all().await;
                    }
                    catalog.insert(name.clone(), fleet);
                    report.added.push(name);
                }
                Some(fleet) => {
                    let new_spec = Arc::new(new_spec);
                    if fleet.spec().significantly_different(&new_spec) {
                        let fleet = fleet.rebuild(new_spec).await;
                        catalog.insert(name.clone(), fleet);
                        report.changed.push(name);
                    } else if fleet.spec().num_procs != new_spec.num_procs {
                        let mut fleet = fleet;
                        fleet.reshape(new_spec).await;
                        catalog.insert(name.clone(), fleet);
                        report.changed.push(name);
                    } else {
                        let mut fleet = fleet;
                        fleet.update_spec_in_place(new_spec).await;
                        catalog.insert(name.clone(), fleet);
                        report.unchanged.push(name);
                    }
                }
            }
        }

        info!(
            removed = report.removed.len(),
            changed = report.changed.len(),
            unchanged = report.unchanged.len(),
            added = report.added.len(),
            "reload reconciled catalog"
        );
        report
    }

    /// Full daemon shutdown: force-stops and tears down every fleet,
    /// leaving the catalog empty. Takes `&self` (rather than consuming
    /// the Supervisor) so callers can hold it behind an `Arc` shared with
    /// the REPL/socket/HTTP surfaces right up to the end.
    pub async fn shutdown(&self) {
        let mut catalog = self.catalog.lock().await;
        let fleets: Vec<Fleet> = catalog.drain().map(|(_, fleet)| fleet).collect();
        drop(catalog);
        for fleet in fleets {
            fleet.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{NixSignalPort, SignalName};
    use crate::spec::RestartPolicy;
    use std::collections::BTreeMap;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn spec(name: &str, command: &str) -> ProgramSpec {
        ProgramSpec {
            name: name.to_string(),
            command: command.to_string(),
            num_procs: 1,
            autostart: false,
            restart_policy: RestartPolicy::Never,
            expected_exit_codes: HashSet::from([0]),
            start_retries: 0,
            start_secs: 1,
            stop_signal: SignalName::Term,
            stop_secs: 2,
            working_dir: PathBuf::from("/"),
            umask: 0o022,
            env: BTreeMap::new(),
            stdout_path: None,
            stderr_path: None,
            discard_output: true,
        }
        .validated()
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_program_start_is_an_error() {
        let sup = Supervisor::new(Arc::new(NixSignalPort));
        let err = sup.start("nope").await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownProgram { .. }));
    }

    #[tokio::test]
    async fn boot_autostarts_flagged_programs() {
        let mut specs = HashMap::new();
        let mut web = spec("web", "/bin/sleep 5");
        web.autostart = true;
        specs.insert("web".to_string(), web);

        let sup = Supervisor::new(Arc::new(NixSignalPort));
        sup.boot(specs).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let statuses = sup.status(Some("web")).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_ne!(statuses[0].workers[0].state, crate::worker::WorkerState::Stopped);

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn reload_removes_changes_and_adds() {
        let mut specs = HashMap::new();
        specs.insert("a".to_string(), spec("a", "/bin/true"));
        specs.insert("b".to_string(), spec("b", "/bin/true"));

        let sup = Supervisor::new(Arc::new(NixSignalPort));
        sup.boot(specs).await;

        let mut next = HashMap::new();
        // "a" dropped, "b" changes command, "c" added.
        let mut b_changed = spec("b", "/bin/false");
        b_changed.stop_secs = 9;
        next.insert("b".to_string(), b_changed);
        next.insert("c".to_string(), spec("c", "/bin/true"));

        let report = sup.reload(next).await;
        assert_eq!(report.removed, vec!["a".to_string()]);
        assert_eq!(report.changed, vec!["b".to_string()]);
        assert_eq!(report.added, vec!["c".to_string()]);
        assert!(report.unchanged.is_empty());

        sup.shutdown().await;
    }
}
