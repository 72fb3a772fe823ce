//! Signal Port: a minimal capability interface for delivering POSIX
//! signals to a supervised process by symbolic name.

use std::fmt;
use std::str::FromStr;

/// Symbolic signal names a Program Spec can name as its `stop_signal`, plus
/// the daemon-level bindings installed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalName {
    Hup,
    Int,
    Quit,
    Term,
    Usr1,
    Usr2,
}

impl fmt::Display for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalName::Hup => "HUP",
            SignalName::Int => "INT",
            SignalName::Quit => "QUIT",
            SignalName::Term => "TERM",
            SignalName::Usr1 => "USR1",
            SignalName::Usr2 => "USR2",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SignalName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HUP" | "SIGHUP" => Ok(SignalName::Hup),
            "INT" | "SIGINT" => Ok(SignalName::Int),
            "QUIT" | "SIGQUIT" => Ok(SignalName::Quit),
            "TERM" | "SIGTERM" => Ok(SignalName::Term),
            "USR1" | "SIGUSR1" => Ok(SignalName::Usr1),
            "USR2" | "SIGUSR2" => Ok(SignalName::Usr2),
            other => Err(format!("unrecognized signal name `{other}`")),
        }
    }
}

/// Capability interface for sending signals to a supervised process. Kept
/// trait-object-friendly (`dyn SignalPort`) so the Supervisor and every
/// Worker it spawns can share one `Arc<dyn SignalPort>` and so tests can
/// substitute a fake that records calls instead of touching real PIDs.
pub trait SignalPort: Send + Sync {
    /// Sends `signal` to `pid`. Returns `false` if the send failed, which
    /// the caller escalates to `SignalFailed` or a forced kill.
    fn send(&self, pid: u32, signal: SignalName) -> bool;

    /// Unconditional termination (`Force-kill`: SIGKILL on POSIX).
    fn force_kill(&self, pid: u32) -> bool;
}

#[cfg(unix)]
pub use unix::NixSignalPort;

#[cfg(unix)]
mod unix {
    use super::{SignalName, SignalPort};
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    fn to_nix(signal: SignalName) -> Signal {
        match signal {
            SignalName::Hup => Signal::SIGHUP,
            SignalName::Int => Signal::SIGINT,
            SignalName::Quit => Signal::SIGQUIT,
            SignalName::Term => Signal::SIGTERM,
            SignalName::Usr1 => Signal::SIGUSR1,
            SignalName::Usr2 => Signal::SIGUSR2,
        }
    }

    /// `SignalPort` backed by `nix::sys::signal::kill`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NixSignalPort;

    impl SignalPort for NixSignalPort {
        fn send(&self, pid: u32, signal: SignalName) -> bool {
            signal::kill(Pid::from_raw(pid as i32), to_nix(signal)).is_ok()
        }

        fn force_kill(&self, pid: u32) -> bool {
            signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok()
        }
    }
}

#[cfg(not(unix))]
pub use fallback::NixSignalPort;

#[cfg(not(unix))]
mod fallback {
    use super::{SignalName, SignalPort};

    /// Non-POSIX platforms have no symbolic signal delivery; every call
    /// reports failure so callers escalate appropriately.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NixSignalPort;

    impl SignalPort for NixSignalPort {
        fn send(&self, _pid: u32, _signal: SignalName) -> bool {
            false
        }

        fn force_kill(&self, _pid: u32) -> bool {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names_case_insensitively() {
        assert_eq!("term".parse::<SignalName>().unwrap(), SignalName::Term);
        assert_eq!("SIGUSR1".parse::<SignalName>().unwrap(), SignalName::Usr1);
    }

    #[test]
    fn rejects_unknown_names() {
        assert!("BOGUS".parse::<SignalName>().is_err());
    }

    #[test]
    fn displays_bare_symbolic_name() {
        assert_eq!(SignalName::Hup.to_string(), "HUP");
    }
}
