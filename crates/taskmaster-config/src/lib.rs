// SPDX-License-Identifier: Apache-2.0

//! Program catalog loader: parses and validates the YAML configuration
//! file into a [`Catalog`] of ready-to-boot
//! [`taskmaster_core::ProgramSpec`]s.

pub mod error;

pub use error::ConfigError;

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use taskmaster_core::{ProgramSpec, RestartPolicy, SignalName};
use tracing::warn;

/// `global` block of the catalog file.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub logfile: PathBuf,
    pub loglevel: u8,
    pub logdir: PathBuf,
    /// Port the line socket binds on `127.0.0.1` (default 9090).
    pub control_port: u16,
    /// Port the HTTP API binds on `127.0.0.1` (default 8080).
    pub http_port: u16,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            logfile: PathBuf::from("taskmaster.log"),
            loglevel: 1,
            logdir: PathBuf::from("."),
            control_port: 9090,
            http_port: 8080,
        }
    }
}

/// A fully parsed and validated catalog: global settings plus every
/// program that passed validation, keyed by name.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub global: GlobalConfig,
    pub programs: HashMap<String, ProgramSpec>,
    /// Human-readable notices for programs that failed validation and
    /// were dropped. Loading proceeds with whatever did validate, as
    /// long as at least one program did.
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default)]
    global: RawGlobal,
    programs: HashMap<String, RawProgramSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
struct RawGlobal {
    logfile: Option<PathBuf>,
    loglevel: Option<u8>,
    logdir: Option<PathBuf>,
    controlport: Option<u16>,
    httpport: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RestartField {
    Bool(bool),
    Name(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UmaskField {
    Num(u32),
    Str(String),
}

impl UmaskField {
    fn resolve(self) -> Result<u32, String> {
        match self {
            UmaskField::Num(n) => Ok(n),
            UmaskField::Str(s) => {
                let trimmed = s.trim();
                let stripped = trimmed.strip_prefix("0o").or_else(|| trimmed.strip_prefix("0O"));
                if let Some(digits) = stripped {
                    u32::from_str_radix(digits, 8).map_err(|e| e.to_string())
                } else if trimmed.len() > 1 && trimmed.starts_with('0') {
                    u32::from_str_radix(trimmed, 8).map_err(|e| e.to_string())
                } else {
                    trimmed.parse::<u32>().map_err(|e| e.to_string())
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
struct RawProgramSpec {
    cmd: String,
    numprocs: Option<usize>,
    autostart: Option<bool>,
    autorestart: Option<RestartField>,
    exitcodes: Option<OneOrMany<i32>>,
    startretries: Option<u32>,
    starttime: Option<u64>,
    stopsignal: Option<String>,
    stoptime: Option<u64>,
    workingdir: Option<PathBuf>,
    umask: Option<UmaskField>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    discardoutput: Option<bool>,
    env: Option<BTreeMap<String, String>>,
}

/// Reads and validates the program catalog at `path`. Programs that fail
/// validation are dropped with a warning rather than aborting the whole
/// load, unless *no* program validates, which is a hard error.
pub fn load(path: &Path) -> Result<Catalog, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_str(&text)
}

/// Parses and validates a catalog already read into memory (used by
/// `load` and directly by tests).
pub fn load_str(text: &str) -> Result<Catalog, ConfigError> {
    let raw: RawFile = serde_yaml::from_str(text)?;

    let defaults = GlobalConfig::default();
    let global = GlobalConfig {
        logfile: raw.global.logfile.unwrap_or(defaults.logfile),
        loglevel: raw.global.loglevel.unwrap_or(defaults.loglevel).min(3),
        logdir: raw.global.logdir.unwrap_or(defaults.logdir),
        control_port: raw.global.controlport.unwrap_or(defaults.control_port),
        http_port: raw.global.httpport.unwrap_or(defaults.http_port),
    };

    let mut programs = HashMap::new();
    let mut warnings = Vec::new();

    for (name, raw_spec) in raw.programs {
        match build_spec(&name, raw_spec, &global) {
            Ok(spec) => {
                programs.insert(name, spec);
            }
            Err(message) => {
                warn!(program = %name, %message, "dropping invalid program from catalog");
                warnings.push(format!("{name}: {message}"));
            }
        }
    }

    if programs.is_empty() && !warnings.is_empty() {
        return Err(ConfigError::NoValidPrograms);
    }

    Ok(Catalog {
        global,
        programs,
        warnings,
    })
}

fn build_spec(name: &str, raw: RawProgramSpec, global: &GlobalConfig) -> Result<ProgramSpec, String> {
    let restart_policy = match raw.autorestart {
        None => RestartPolicy::OnUnexpected,
        Some(RestartField::Bool(true)) => RestartPolicy::Always,
        Some(RestartField::Bool(false)) => RestartPolicy::Never,
        Some(RestartField::Name(name)) => match name.to_ascii_lowercase().as_str() {
            "always" => RestartPolicy::Always,
            "never" => RestartPolicy::Never,
            "unexpected" => RestartPolicy::OnUnexpected,
            other => return Err(format!("unrecognized autorestart value `{other}`")),
        },
    };

    let expected_exit_codes: HashSet<i32> = raw
        .exitcodes
        .map(OneOrMany::into_vec)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![0])
        .into_iter()
        .collect();

    let stop_signal = match raw.stopsignal {
        Some(s) => s.parse::<SignalName>()?,
        None => SignalName::Term,
    };

    let umask = match raw.umask {
        Some(u) => u.resolve()?,
        None => 0o022,
    };

    let resolve_log_path = |p: Option<PathBuf>| -> Option<PathBuf> {
        p.map(|path| {
            if path.is_relative() {
                global.logdir.join(path)
            } else {
                path
            }
        })
    };

    ProgramSpec {
        name: name.to_string(),
        command: raw.cmd,
        num_procs: raw.numprocs.unwrap_or(1),
        autostart: raw.autostart.unwrap_or(true),
        restart_policy,
        expected_exit_codes,
        start_retries: raw.startretries.unwrap_or(3),
        start_secs: raw.starttime.unwrap_or(1),
        stop_signal,
        stop_secs: raw.stoptime.unwrap_or(10),
        working_dir: raw.workingdir.unwrap_or_else(|| PathBuf::from(".")),
        umask,
        env: raw.env.unwrap_or_default(),
        stdout_path: resolve_log_path(raw.stdout),
        stderr_path: resolve_log_path(raw.stderr),
        discard_output: raw.discardoutput.unwrap_or(false),
    }
    .validated()
    .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_program() {
        let yaml = r#"
programs:
  web:
    cmd: /bin/true
"#;
        let catalog = load_str(yaml).unwrap();
        let web = &catalog.programs["web"];
        assert_eq!(web.num_procs, 1);
        assert!(web.autostart);
        assert_eq!(web.restart_policy, RestartPolicy::OnUnexpected);
        assert_eq!(web.expected_exit_codes, HashSet::from([0]));
    }

    #[test]
    fn parses_exitcodes_as_scalar_or_list() {
        let yaml = r#"
programs:
  a:
    cmd: /bin/true
    exitcodes: 2
  b:
    cmd: /bin/true
    exitcodes: [0, 2]
"#;
        let catalog = load_str(yaml).unwrap();
        assert_eq!(catalog.programs["a"].expected_exit_codes, HashSet::from([2]));
        assert_eq!(catalog.programs["b"].expected_exit_codes, HashSet::from([0, 2]));
    }

    #[test]
    fn parses_autorestart_variants() {
        let yaml = r#"
programs:
  always:
    cmd: /bin/true
    autorestart: true
  never:
    cmd: /bin/true
    autorestart: never
  unexpected:
    cmd: /bin/true
    autorestart: unexpected
"#;
        let catalog = load_str(yaml).unwrap();
        assert_eq!(catalog.programs["always"].restart_policy, RestartPolicy::Always);
        assert_eq!(catalog.programs["never"].restart_policy, RestartPolicy::Never);
        assert_eq!(
            catalog.programs["unexpected"].restart_policy,
            RestartPolicy::OnUnexpected
        );
    }

    #[test]
    fn parses_octal_and_decimal_umask() {
        let yaml = r#"
programs:
  octal:
    cmd: /bin/true
    umask: "022"
  decimal:
    cmd: /bin/true
    umask: 18
"#;
        let catalog = load_str(yaml).unwrap();
        assert_eq!(catalog.programs["octal"].umask, 0o022);
        assert_eq!(catalog.programs["decimal"].umask, 18);
    }

    #[test]
    fn relative_log_paths_resolve_under_logdir() {
        let yaml = r#"
global:
  logdir: /var/log/taskmaster
programs:
  web:
    cmd: /bin/true
    stdout: web.out.log
"#;
        let catalog = load_str(yaml).unwrap();
        assert_eq!(
            catalog.programs["web"].stdout_path,
            Some(PathBuf::from("/var/log/taskmaster/web.out.log"))
        );
    }

    #[test]
    fn invalid_program_is_dropped_with_warning_others_still_load() {
        let yaml = r#"
programs:
  bad:
    cmd: "   "
  good:
    cmd: /bin/true
"#;
        let catalog = load_str(yaml).unwrap();
        assert!(!catalog.programs.contains_key("bad"));
        assert!(catalog.programs.contains_key("good"));
        assert_eq!(catalog.warnings.len(), 1);
    }

    #[test]
    fn all_programs_invalid_is_a_hard_error() {
        let yaml = r#"
programs:
  bad:
    cmd: "   "
"#;
        let err = load_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::NoValidPrograms));
    }
}
