//! Cloud→edge command handling.
//!
//! Commands arrive on `microlink/{site}/{block}/command/{kind}`; the kind
//! is the topic leaf.  Four are handled directly by the orchestrator;
//! controller-bound kinds are acknowledged as accepted for forwarding;
//! anything else is rejected with a structured response.

use mcs_proto::{CommandRequest, CommandResponse, CommandStatus};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::storage::buffer::Buffer;
use crate::supervisor::SupervisorHandle;

/// Command kinds owned by a downstream controller, not the orchestrator.
const FORWARDED_KINDS: [&str; 2] = ["mode_override", "alarm_ack_sync"];

pub struct CommandHandler {
    buffer: Arc<Mutex<Buffer>>,
    supervisor: SupervisorHandle,
}

impl CommandHandler {
    pub fn new(buffer: Arc<Mutex<Buffer>>, supervisor: SupervisorHandle) -> Self {
        CommandHandler { buffer, supervisor }
    }

    /// Execute one command and build the response to post back.
    pub async fn handle(&self, request: &CommandRequest) -> CommandResponse {
        info!(cmd = %request.cmd, request_id = %request.request_id, "command received");

        let (status, reason, result) = match request.cmd.as_str() {
            "config_reload" => self.config_reload(),
            "adapter_restart" => self.adapter_restart(&request.params).await,
            "buffer_flush" => self.buffer_flush(),
            "diagnostics_request" => self.diagnostics(),
            kind if FORWARDED_KINDS.contains(&kind) => (
                CommandStatus::Accepted,
                format!("command {} accepted for forwarding", kind),
                None,
            ),
            unknown => {
                warn!(cmd = %unknown, "unknown command rejected");
                (
                    CommandStatus::Rejected,
                    format!("unknown command: {}", unknown),
                    None,
                )
            }
        };

        CommandResponse {
            ts: chrono::Utc::now().to_rfc3339(),
            request_id: request.request_id.clone(),
            status,
            reason,
            result,
        }
    }

    fn config_reload(&self) -> (CommandStatus, String, Option<serde_json::Value>) {
        // Adapters re-read their YAML on restart; schedule one per process.
        self.supervisor.request_reload();
        (
            CommandStatus::Accepted,
            String::new(),
            Some(json!({ "action": "config_reload_scheduled" })),
        )
    }

    async fn adapter_restart(
        &self,
        params: &serde_json::Value,
    ) -> (CommandStatus, String, Option<serde_json::Value>) {
        let name = params
            .get("adapter")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if name.is_empty() {
            return (
                CommandStatus::Rejected,
                "adapter_restart requires params.adapter".to_owned(),
                None,
            );
        }
        if self.supervisor.restart(name).await {
            (
                CommandStatus::Accepted,
                String::new(),
                Some(json!({ "adapter": name, "action": "restart_scheduled" })),
            )
        } else {
            (
                CommandStatus::Rejected,
                format!("no supervised adapter named '{}'", name),
                None,
            )
        }
    }

    fn buffer_flush(&self) -> (CommandStatus, String, Option<serde_json::Value>) {
        let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
        match buffer.commit() {
            Ok(()) => (
                CommandStatus::Accepted,
                String::new(),
                Some(json!({ "action": "flush_committed", "depth": buffer.depth() })),
            ),
            Err(e) => (CommandStatus::Error, e.to_string(), None),
        }
    }

    fn diagnostics(&self) -> (CommandStatus, String, Option<serde_json::Value>) {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        sys.refresh_cpu_usage();

        let hostname = sysinfo::System::host_name().unwrap_or_default();
        let uptime_host_s = sysinfo::System::uptime();

        (
            CommandStatus::Accepted,
            String::new(),
            Some(json!({
                "hostname": hostname,
                "os": sysinfo::System::long_os_version().unwrap_or_default(),
                "cpu_count": sys.cpus().len(),
                "mem_total_mb": sys.total_memory() / 1024 / 1024,
                "uptime_host_s": uptime_host_s,
                "buffer_depth": self.buffer.lock().expect("buffer lock poisoned").depth(),
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn handler() -> (CommandHandler, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let buffer = Arc::new(Mutex::new(Buffer::open(file.path(), 100).unwrap()));
        let supervisor = SupervisorHandle::for_tests(vec!["modbus".to_owned()]);
        (CommandHandler::new(buffer, supervisor), file)
    }

    fn request(cmd: &str, params: serde_json::Value) -> CommandRequest {
        CommandRequest {
            cmd: cmd.to_owned(),
            request_id: "req-1".to_owned(),
            params,
        }
    }

    #[tokio::test]
    async fn unknown_command_is_rejected_with_reason() {
        let (handler, _file) = handler();
        let resp = handler.handle(&request("self_destruct", json!({}))).await;
        assert_eq!(resp.status, CommandStatus::Rejected);
        assert!(resp.reason.contains("self_destruct"));
        assert_eq!(resp.request_id, "req-1");
    }

    #[tokio::test]
    async fn controller_commands_are_accepted_for_forwarding() {
        let (handler, _file) = handler();
        let resp = handler.handle(&request("mode_override", json!({}))).await;
        assert_eq!(resp.status, CommandStatus::Accepted);
        assert!(resp.reason.contains("forwarding"));
    }

    #[tokio::test]
    async fn buffer_flush_reports_depth() {
        let (handler, _file) = handler();
        handler
            .buffer
            .lock()
            .unwrap()
            .append("t/a", b"x", 0, false)
            .unwrap();
        let resp = handler.handle(&request("buffer_flush", json!({}))).await;
        assert_eq!(resp.status, CommandStatus::Accepted);
        assert_eq!(resp.result.unwrap()["depth"], 1);
    }

    #[tokio::test]
    async fn adapter_restart_validates_the_name() {
        let (handler, _file) = handler();
        let resp = handler.handle(&request("adapter_restart", json!({}))).await;
        assert_eq!(resp.status, CommandStatus::Rejected);

        let resp = handler
            .handle(&request("adapter_restart", json!({ "adapter": "modbus" })))
            .await;
        assert_eq!(resp.status, CommandStatus::Accepted);

        let resp = handler
            .handle(&request("adapter_restart", json!({ "adapter": "nope" })))
            .await;
        assert_eq!(resp.status, CommandStatus::Rejected);
    }

    #[tokio::test]
    async fn config_reload_is_accepted() {
        let (handler, _file) = handler();
        let resp = handler.handle(&request("config_reload", json!({}))).await;
        assert_eq!(resp.status, CommandStatus::Accepted);
        assert_eq!(
            resp.result.unwrap()["action"],
            "config_reload_scheduled"
        );
    }
}
