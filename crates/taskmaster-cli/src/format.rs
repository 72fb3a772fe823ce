//! Shared status-line formatting for the REPL, line socket, and the
//! `USR1` log dump: `<name>-<index> (pid <pid>): <State>[, up for
//! <duration>]`.

use std::time::Duration;
use taskmaster_core::{WorkerSnapshot, WorkerState};

pub fn state_label(state: WorkerState) -> &'static str {
    match state {
        WorkerState::Stopped => "Stopped",
        WorkerState::Starting => "Starting",
        WorkerState::Running => "Running",
        WorkerState::Stopping => "Stopping",
        WorkerState::Backoff => "Backoff",
        WorkerState::Fatal => "Fatal",
    }
}

pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

pub fn format_status_line(program: &str, snapshot: &WorkerSnapshot) -> String {
    let pid = snapshot
        .pid
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!("{program}-{} (pid {pid}): {}", snapshot.index, state_label(snapshot.state));

    if snapshot.state == WorkerState::Running {
        if let Some(uptime) = snapshot.uptime() {
            line.push_str(&format!(", up for {}", format_duration(uptime)));
        }
    }

    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn formats_stopped_worker_without_uptime() {
        let snapshot = WorkerSnapshot {
            index: 0,
            pid: None,
            state: WorkerState::Stopped,
            started_at: None,
            started_at_wall: None,
            restart_count: 0,
            stop_requested: false,
        };
        assert_eq!(format_status_line("web", &snapshot), "web-0 (pid -): Stopped");
    }

    #[test]
    fn formats_running_worker_with_uptime() {
        let snapshot = WorkerSnapshot {
            index: 1,
            pid: Some(4242),
            state: WorkerState::Running,
            started_at: Some(Instant::now()),
            started_at_wall: Some(chrono::Utc::now()),
            restart_count: 0,
            stop_requested: false,
        };
        let line = format_status_line("web", &snapshot);
        assert!(line.starts_with("web-1 (pid 4242): Running, up for"));
    }

    #[test]
    fn duration_formatting_scales_with_magnitude() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }
}
