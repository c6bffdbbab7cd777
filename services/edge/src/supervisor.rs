//! Adapter subprocess supervision.
//!
//! Each configured adapter runs as a child process, restarted with a
//! capped delay when it exits.  Status snapshots feed the heartbeat's
//! per-adapter section.

use mcs_proto::AdapterStatus;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::AdapterProcessConfig;

const RESTART_BASE_DELAY: Duration = Duration::from_secs(5);
const RESTART_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone)]
struct ProcessState {
    status: String,
    pid: Option<u32>,
    restarts: u32,
    restart_requested: bool,
    reload_requested: bool,
}

/// Shared view of the supervised process table.
#[derive(Clone)]
pub struct SupervisorHandle {
    states: Arc<Mutex<BTreeMap<String, ProcessState>>>,
}

impl SupervisorHandle {
    fn new(names: impl IntoIterator<Item = String>) -> Self {
        let mut map = BTreeMap::new();
        for name in names {
            map.insert(
                name,
                ProcessState {
                    status: "stopped".to_owned(),
                    ..ProcessState::default()
                },
            );
        }
        SupervisorHandle {
            states: Arc::new(Mutex::new(map)),
        }
    }

    /// Handle with known names but no running processes (unit tests).
    pub fn for_tests(names: Vec<String>) -> Self {
        Self::new(names)
    }

    /// Per-adapter status snapshots for the heartbeat.
    pub fn statuses(&self) -> BTreeMap<String, AdapterStatus> {
        self.states
            .lock()
            .expect("supervisor lock poisoned")
            .iter()
            .map(|(name, s)| {
                (
                    name.clone(),
                    AdapterStatus {
                        status: s.status.clone(),
                        pid: s.pid,
                        restarts: s.restarts,
                    },
                )
            })
            .collect()
    }

    /// Request a restart of one adapter.  Returns false for unknown names.
    pub async fn restart(&self, name: &str) -> bool {
        let mut states = self.states.lock().expect("supervisor lock poisoned");
        match states.get_mut(name) {
            Some(state) => {
                state.restart_requested = true;
                true
            }
            None => false,
        }
    }

    /// Request a rolling restart of every adapter so configs are re-read.
    pub fn request_reload(&self) {
        let mut states = self.states.lock().expect("supervisor lock poisoned");
        for state in states.values_mut() {
            state.reload_requested = true;
        }
    }

    fn set(&self, name: &str, f: impl FnOnce(&mut ProcessState)) {
        let mut states = self.states.lock().expect("supervisor lock poisoned");
        if let Some(state) = states.get_mut(name) {
            f(state);
        }
    }

    fn take_restart_flags(&self, name: &str) -> bool {
        let mut states = self.states.lock().expect("supervisor lock poisoned");
        match states.get_mut(name) {
            Some(state) => {
                let requested = state.restart_requested || state.reload_requested;
                state.restart_requested = false;
                state.reload_requested = false;
                requested
            }
            None => false,
        }
    }
}

/// Spawn supervision tasks for every configured adapter and return the
/// shared handle.
pub fn start(adapters: &BTreeMap<String, AdapterProcessConfig>) -> SupervisorHandle {
    let handle = SupervisorHandle::new(adapters.keys().cloned());
    for (name, cfg) in adapters {
        tokio::spawn(supervise(name.clone(), cfg.clone(), handle.clone()));
    }
    handle
}

async fn supervise(name: String, cfg: AdapterProcessConfig, handle: SupervisorHandle) {
    let mut restarts: u32 = 0;

    loop {
        if restarts > cfg.max_restarts {
            error!(adapter = %name, max_restarts = cfg.max_restarts, "restart budget exhausted");
            handle.set(&name, |s| s.status = "failed".to_owned());
            return;
        }

        info!(adapter = %name, attempt = restarts + 1, "starting adapter process");
        let mut command = Command::new(&cfg.command[0]);
        command.args(&cfg.command[1..]);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(adapter = %name, error = %e, "adapter spawn failed");
                restarts += 1;
                handle.set(&name, |s| {
                    s.status = "stopped".to_owned();
                    s.pid = None;
                    s.restarts = restarts;
                });
                tokio::time::sleep(restart_delay(restarts)).await;
                continue;
            }
        };

        handle.set(&name, |s| {
            s.status = "running".to_owned();
            s.pid = child.id();
            s.restarts = restarts;
        });

        // Wait for exit, checking for operator-requested restarts.
        loop {
            tokio::select! {
                exit = child.wait() => {
                    match exit {
                        Ok(status) => warn!(adapter = %name, %status, "adapter exited"),
                        Err(e) => error!(adapter = %name, error = %e, "adapter wait failed"),
                    }
                    break;
                }
                () = tokio::time::sleep(Duration::from_secs(1)) => {
                    if handle.take_restart_flags(&name) {
                        info!(adapter = %name, "restart requested, terminating child");
                        let _ = child.kill().await;
                        break;
                    }
                }
            }
        }

        restarts += 1;
        handle.set(&name, |s| {
            s.status = "stopped".to_owned();
            s.pid = None;
            s.restarts = restarts;
        });
        tokio::time::sleep(restart_delay(restarts)).await;
    }
}

fn restart_delay(restarts: u32) -> Duration {
    (RESTART_BASE_DELAY * restarts).min(RESTART_MAX_DELAY)
}
