//! Program Spec: the immutable, validated description of one
//! supervised program.

use crate::error::CoreError;
use crate::signal::SignalName;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Restart policy applied when a worker's child process exits outside of
/// an operator-requested stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    Never,
    OnUnexpected,
}

/// Immutable, validated description of one catalog entry. Constructed only
/// through [`ProgramSpec::validated`], which enforces its invariants.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramSpec {
    pub name: String,
    pub command: String,
    pub num_procs: usize,
    pub autostart: bool,
    pub restart_policy: RestartPolicy,
    pub expected_exit_codes: HashSet<i32>,
    pub start_retries: u32,
    pub start_secs: u64,
    pub stop_signal: SignalName,
    pub stop_secs: u64,
    pub working_dir: PathBuf,
    pub umask: u32,
    pub env: BTreeMap<String, String>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub discard_output: bool,
}

impl ProgramSpec {
    /// Validates the spec's invariants, returning a `ConfigInvalid`
    /// error naming the offending field on failure.
    pub fn validated(self) -> Result<Self, CoreError> {
        let fail = |message: &str| CoreError::ConfigInvalid {
            name: self.name.clone(),
            message: message.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(fail("name must not be empty"));
        }
        if self.num_procs < 1 {
            return Err(fail("num_procs must be >= 1"));
        }
        if self.start_secs < 1 {
            return Err(fail("start_secs must be >= 1"));
        }
        if self.stop_secs < 1 {
            return Err(fail("stop_secs must be >= 1"));
        }
        if self.umask > 0o777 {
            return Err(fail("umask must be in [0, 0o777]"));
        }
        if self.expected_exit_codes.is_empty() {
            return Err(fail("expected_exit_codes must be non-empty"));
        }
        if self.command.split_whitespace().next().is_none() {
            return Err(fail("command must name an executable"));
        }

        Ok(self)
    }

    /// argv[0] and the remaining arguments, split from `command` on
    /// whitespace. No shell is involved.
    pub fn argv(&self) -> (String, Vec<String>) {
        let mut parts = self.command.split_whitespace();
        let exe = parts.next().unwrap_or_default().to_string();
        let args = parts.map(str::to_string).collect();
        (exe, args)
    }

    /// Whether a completed exit code counts as expected for this spec.
    pub fn exit_expected(&self, code: i32) -> bool {
        self.expected_exit_codes.contains(&code)
    }

    /// Whether an exit (outside of an operator stop) should trigger a
    /// restart attempt, per the restart policy table.
    pub fn should_restart(&self, exit_code: Option<i32>) -> bool {
        match self.restart_policy {
            RestartPolicy::Always => true,
            RestartPolicy::Never => false,
            RestartPolicy::OnUnexpected => match exit_code {
                Some(code) => !self.exit_expected(code),
                // Killed by signal, no exit code: always unexpected.
                None => true,
            },
        }
    }

    /// Backoff duration for the Nth consecutive restart attempt (1-based),
    /// clamped at 20s.
    pub fn backoff_duration(restart_count: u32) -> std::time::Duration {
        let secs = 2u64.saturating_pow(restart_count.saturating_sub(1));
        std::time::Duration::from_secs(secs.min(20))
    }

    /// Computed stdout log path for worker `index`, or `None` when
    /// `stdout_path` is unset.
    pub fn stdout_path_for(&self, index: usize) -> Option<PathBuf> {
        self.stdout_path
            .as_ref()
            .map(|p| suffixed_log_path(p, index, self.num_procs))
    }

    /// Computed stderr log path for worker `index`, or `None` when
    /// `stderr_path` is unset.
    pub fn stderr_path_for(&self, index: usize) -> Option<PathBuf> {
        self.stderr_path
            .as_ref()
            .map(|p| suffixed_log_path(p, index, self.num_procs))
    }

    /// Whether `other` differs from `self` in a field considered a
    /// significant change, one that forces a full restart on reload.
    /// `num_procs` is deliberately excluded: a fleet reshapes its worker
    /// count on its own, without disturbing surviving instances.
    pub fn significantly_different(&self, other: &ProgramSpec) -> bool {
        self.command != other.command
            || self.stop_signal != other.stop_signal
            || self.stop_secs != other.stop_secs
            || self.working_dir != other.working_dir
            || self.umask != other.umask
            || self.env != other.env
            || self.stdout_path != other.stdout_path
            || self.stderr_path != other.stderr_path
            || self.discard_output != other.discard_output
    }
}

/// Inserts a `-N` suffix before the file extension (or appends it when
/// there is no extension). A `num_procs` of 1 never suffixes.
fn suffixed_log_path(path: &Path, index: usize, num_procs: usize) -> PathBuf {
    if num_procs <= 1 {
        return path.to_path_buf();
    }

    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let file_name = match path.extension() {
        Some(ext) => format!("{stem}-{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{index}"),
    };

    parent.join(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> ProgramSpec {
        ProgramSpec {
            name: "web".to_string(),
            command: "/bin/true".to_string(),
            num_procs: 1,
            autostart: true,
            restart_policy: RestartPolicy::OnUnexpected,
            expected_exit_codes: [0].into_iter().collect(),
            start_retries: 3,
            start_secs: 1,
            stop_signal: SignalName::Term,
            stop_secs: 5,
            working_dir: PathBuf::from("/"),
            umask: 0o022,
            env: BTreeMap::new(),
            stdout_path: Some(PathBuf::from("/var/log/web.log")),
            stderr_path: None,
            discard_output: false,
        }
    }

    #[test]
    fn validated_rejects_empty_name() {
        let mut spec = base_spec();
        spec.name.clear();
        assert!(spec.validated().is_err());
    }

    #[test]
    fn validated_rejects_zero_num_procs() {
        let mut spec = base_spec();
        spec.num_procs = 0;
        assert!(spec.validated().is_err());
    }

    #[test]
    fn validated_rejects_bad_umask() {
        let mut spec = base_spec();
        spec.umask = 0o1000;
        assert!(spec.validated().is_err());
    }

    #[test]
    fn argv_splits_first_token_as_executable() {
        let mut spec = base_spec();
        spec.command = "/usr/bin/env FOO=bar python3 app.py".to_string();
        let (exe, args) = spec.argv();
        assert_eq!(exe, "/usr/bin/env");
        assert_eq!(args, vec!["FOO=bar", "python3", "app.py"]);
    }

    #[test]
    fn should_restart_always_ignores_exit_code() {
        let mut spec = base_spec();
        spec.restart_policy = RestartPolicy::Always;
        assert!(spec.should_restart(Some(0)));
    }

    #[test]
    fn should_restart_never_ignores_exit_code() {
        let mut spec = base_spec();
        spec.restart_policy = RestartPolicy::Never;
        assert!(!spec.should_restart(Some(1)));
    }

    #[test]
    fn should_restart_on_unexpected_checks_exit_set() {
        let spec = base_spec(); // OnUnexpected, expects {0}
        assert!(!spec.should_restart(Some(0)));
        assert!(spec.should_restart(Some(1)));
        assert!(spec.should_restart(None));
    }

    #[test]
    fn backoff_clamps_at_20_seconds() {
        assert_eq!(
            ProgramSpec::backoff_duration(1),
            std::time::Duration::from_secs(1)
        );
        assert_eq!(
            ProgramSpec::backoff_duration(2),
            std::time::Duration::from_secs(2)
        );
        // restart #6 would be 2^5 = 32s uncapped; must clamp to 20s.
        assert_eq!(
            ProgramSpec::backoff_duration(6),
            std::time::Duration::from_secs(20)
        );
    }

    #[test]
    fn log_path_unsuffixed_when_single_instance() {
        let spec = base_spec();
        assert_eq!(
            spec.stdout_path_for(0),
            Some(PathBuf::from("/var/log/web.log"))
        );
    }

    #[test]
    fn log_path_suffixed_before_extension_when_multi_instance() {
        let mut spec = base_spec();
        spec.num_procs = 3;
        assert_eq!(
            spec.stdout_path_for(1),
            Some(PathBuf::from("/var/log/web-1.log"))
        );
    }

    #[test]
    fn log_path_suffixed_without_extension() {
        let mut spec = base_spec();
        spec.num_procs = 2;
        spec.stdout_path = Some(PathBuf::from("/var/log/weblog"));
        assert_eq!(
            spec.stdout_path_for(0),
            Some(PathBuf::from("/var/log/weblog-0"))
        );
    }

    #[test]
    fn significant_change_detects_command_diff() {
        let a = base_spec();
        let mut b = base_spec();
        b.command = "/bin/false".to_string();
        assert!(a.significantly_different(&b));
    }

    #[test]
    fn non_significant_fields_do_not_trigger_restart() {
        let a = base_spec();
        let mut b = base_spec();
        b.start_retries = 99;
        b.start_secs = 42;
        b.restart_policy = RestartPolicy::Always;
        assert!(!a.significantly_different(&b));
    }

    #[test]
    fn num_procs_alone_is_not_a_significant_change() {
        let a = base_spec();
        let mut b = base_spec();
        b.num_procs = 4;
        assert!(!a.significantly_different(&b));
    }
}
