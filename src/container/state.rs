//! Container run state
//!
//! A mutex-guarded snapshot plus a condvar notified on every transition,
//! which is what `wait` blocks on. The snapshot itself is what gets
//! serialized into `config.json`.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DaemonError, Result};

/// Serializable view of a container's run state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct StateSnapshot {
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    pub pid: i32,
    pub exit_code: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Live state with waiters.
pub struct State {
    inner: Mutex<StateSnapshot>,
    changed: Condvar,
}

impl State {
    pub fn new() -> Self {
        Self::from_snapshot(StateSnapshot::default())
    }

    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            inner: Mutex::new(snapshot),
            changed: Condvar::new(),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).running
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).paused
    }

    pub fn is_restarting(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .restarting
    }

    pub fn pid(&self) -> i32 {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).pid
    }

    pub fn exit_code(&self) -> i32 {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .exit_code
    }

    pub fn set_running(&self, pid: i32) {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        state.running = true;
        state.paused = false;
        state.restarting = false;
        state.pid = pid;
        state.exit_code = 0;
        state.started_at = Some(Utc::now());
        state.finished_at = None;
        self.changed.notify_all();
    }

    pub fn set_stopped(&self, exit_code: i32) {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        state.running = false;
        state.paused = false;
        state.restarting = false;
        state.pid = 0;
        state.exit_code = exit_code;
        state.finished_at = Some(Utc::now());
        self.changed.notify_all();
    }

    /// Mark the container as between exit and policy-driven restart.
    pub fn set_restarting(&self, exit_code: i32) {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        state.running = false;
        state.restarting = true;
        state.paused = false;
        state.pid = 0;
        state.exit_code = exit_code;
        state.finished_at = Some(Utc::now());
        self.changed.notify_all();
    }

    /// Adopt a process found alive during restore: keep the recorded start
    /// time, refresh the pid.
    pub fn adopt_running(&self, pid: i32) {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        state.running = true;
        state.paused = false;
        state.restarting = false;
        state.pid = pid;
        state.finished_at = None;
        self.changed.notify_all();
    }

    pub fn set_paused(&self) {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        state.paused = true;
        self.changed.notify_all();
    }

    pub fn set_unpaused(&self) {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        state.paused = false;
        self.changed.notify_all();
    }

    /// Block until the container stops, returning its exit code. `timeout`
    /// of `None` waits forever.
    pub fn wait_stop(&self, timeout: Option<Duration>) -> Result<i32> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        while state.running {
            match deadline {
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(|p| p.into_inner());
                }
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Err(DaemonError::Timeout);
                    }
                    let (guard, _) = self
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|p| p.into_inner());
                    state = guard;
                }
            }
        }
        Ok(state.exit_code)
    }

    /// Human status line, the `STATUS` column of the `containers` handler.
    pub fn status_string(&self) -> String {
        let state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if state.running {
            let up = state
                .started_at
                .map(|t| human_duration(Utc::now() - t))
                .unwrap_or_default();
            if state.paused {
                return format!("Up {} (Paused)", up);
            }
            return format!("Up {}", up);
        }
        if state.restarting {
            return format!("Restarting ({})", state.exit_code);
        }
        match state.finished_at {
            Some(t) => format!(
                "Exited ({}) {} ago",
                state.exit_code,
                human_duration(Utc::now() - t)
            ),
            None => "Created".to_string(),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

fn human_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    match secs {
        0..=59 => format!("{} seconds", secs),
        60..=3599 => format!("{} minutes", secs / 60),
        3600..=86399 => format!("{} hours", secs / 3600),
        _ => format!("{} days", secs / 86400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fresh_state_is_created() {
        let state = State::new();
        assert!(!state.is_running());
        assert!(!state.is_paused());
        assert_eq!(state.status_string(), "Created");
    }

    #[test]
    fn test_running_transition() {
        let state = State::new();
        state.set_running(42);
        assert!(state.is_running());
        assert_eq!(state.pid(), 42);
        assert!(state.snapshot().started_at.is_some());
        assert!(state.status_string().starts_with("Up"));
    }

    #[test]
    fn test_stopped_transition() {
        let state = State::new();
        state.set_running(42);
        state.set_stopped(3);
        assert!(!state.is_running());
        assert_eq!(state.pid(), 0);
        assert_eq!(state.exit_code(), 3);
        assert!(state.status_string().starts_with("Exited (3)"));
    }

    #[test]
    fn test_pause_cycle() {
        let state = State::new();
        state.set_running(42);
        state.set_paused();
        assert!(state.is_paused());
        assert!(state.status_string().contains("Paused"));
        state.set_unpaused();
        assert!(!state.is_paused());
        assert!(state.is_running());
    }

    #[test]
    fn test_restarting_state() {
        let state = State::new();
        state.set_running(42);
        state.set_restarting(1);
        assert!(state.is_restarting());
        assert!(!state.is_running());
        assert_eq!(state.status_string(), "Restarting (1)");
        // The next start clears the flag.
        state.set_running(43);
        assert!(!state.is_restarting());
    }

    #[test]
    fn test_wait_stop_already_stopped() {
        let state = State::new();
        state.set_running(42);
        state.set_stopped(7);
        assert_eq!(state.wait_stop(None).unwrap(), 7);
    }

    #[test]
    fn test_wait_stop_timeout() {
        let state = State::new();
        state.set_running(42);
        let err = state
            .wait_stop(Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, DaemonError::Timeout));
    }

    #[test]
    fn test_wait_stop_wakes_on_stop() {
        let state = Arc::new(State::new());
        state.set_running(42);

        let waiter = Arc::clone(&state);
        let handle = std::thread::spawn(move || waiter.wait_stop(Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(50));
        state.set_stopped(9);
        assert_eq!(handle.join().unwrap().unwrap(), 9);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let state = State::new();
        state.set_running(42);
        state.set_stopped(-127);
        let json = serde_json::to_string(&state.snapshot()).unwrap();
        let restored: StateSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.exit_code, -127);
        assert!(!restored.running);
        let revived = State::from_snapshot(restored);
        assert_eq!(revived.exit_code(), -127);
    }

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(chrono::Duration::seconds(30)), "30 seconds");
        assert_eq!(human_duration(chrono::Duration::seconds(120)), "2 minutes");
        assert_eq!(human_duration(chrono::Duration::hours(5)), "5 hours");
        assert_eq!(human_duration(chrono::Duration::days(3)), "3 days");
    }
}
