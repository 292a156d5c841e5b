//! Wire protocol between the control plane and sites.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}`.
//! Frames are decoded into closed enums at the connection boundary so the
//! rest of the control plane never touches an untyped payload.

use serde::{Deserialize, Deserializer, Serialize};

use crate::commands::CommandType;
use crate::failure::FailureKind;

/// Events a site sends to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundMessage {
    Authenticate(AuthenticateRequest),
    Heartbeat(HeartbeatReport),
    CommandResult(CommandResult),
    DeployProgress(DeployProgress),
    UpdateProgress(UpdateProgress),
    SyncLocalState(LocalStateReport),
}

impl InboundMessage {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => "authenticate",
            Self::Heartbeat(_) => "heartbeat",
            Self::CommandResult(_) => "command_result",
            Self::DeployProgress(_) => "deploy_progress",
            Self::UpdateProgress(_) => "update_progress",
            Self::SyncLocalState(_) => "sync_local_state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    pub site_id: String,
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    #[serde(default)]
    pub metrics: HeartbeatMetrics,
}

/// Device vitals carried by a heartbeat. All fields are optional; older
/// players report only a subset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMetrics {
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub disk_percent: Option<f64>,
    #[serde(default)]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub uptime_secs: Option<u64>,
}

/// Terminal status reported for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Explicit failure kind, when the site knows it.
    #[serde(default)]
    pub error_kind: Option<FailureKind>,
}

impl CommandResult {
    /// Failure kind, falling back to classification of the error text.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        if self.status == ResultStatus::Completed {
            return None;
        }
        Some(
            self.error_kind
                .unwrap_or_else(|| FailureKind::classify(self.error.as_deref().unwrap_or(""))),
        )
    }
}

/// Players report progress as any JSON number (`42`, `99.5`, sometimes
/// past 100); it is clamped to 0..=100.
fn percent<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let value = f64::deserialize(deserializer)?;
    Ok(value.clamp(0.0, 100.0).round() as u8)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployProgress {
    #[serde(default)]
    pub deployment_id: Option<String>,
    /// Older players identify the deployment by video instead.
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(deserialize_with = "percent")]
    pub progress: u8,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProgress {
    pub deployment_id: String,
    #[serde(deserialize_with = "percent")]
    pub progress: u8,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalStateReport {
    pub config: serde_json::Value,
    pub config_hash: String,
    pub timestamp: u64,
}

/// Events the control plane sends to a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    Authenticated {
        #[serde(rename = "siteId")]
        site_id: String,
    },
    AuthError {
        message: String,
    },
    Command(CommandEnvelope),
    /// Pass-through group broadcast (live scores, match metadata, ...).
    Broadcast {
        topic: String,
        payload: serde_json::Value,
    },
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_authenticate() {
        let msg = InboundMessage::decode(
            r#"{"event":"authenticate","data":{"siteId":"site-1","credential":"s3cret"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::Authenticate(AuthenticateRequest {
                site_id: "site-1".to_string(),
                credential: "s3cret".to_string(),
            })
        );
    }

    #[test]
    fn decodes_partial_heartbeat() {
        let msg = InboundMessage::decode(
            r#"{"event":"heartbeat","data":{"metrics":{"temperatureC":71.5}}}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::Heartbeat(report) => {
                assert_eq!(report.metrics.temperature_c, Some(71.5));
                assert_eq!(report.metrics.disk_percent, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn progress_accepts_any_number_and_clamps() {
        let progress = |raw: &str| {
            let frame = format!(
                r#"{{"event":"update_progress","data":{{"deploymentId":"d1","progress":{raw}}}}}"#
            );
            match InboundMessage::decode(&frame).unwrap() {
                InboundMessage::UpdateProgress(p) => p.progress,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(progress("100.0"), 100);
        assert_eq!(progress("42.6"), 43);
        assert_eq!(progress("300"), 100);
        assert_eq!(progress("-5"), 0);

        let msg = InboundMessage::decode(
            r#"{"event":"deploy_progress","data":{"videoId":"v1","progress":100.0,"completed":true}}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::DeployProgress(p) => {
                assert_eq!(p.progress, 100);
                assert!(p.completed);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        assert!(InboundMessage::decode(r#"{"event":"dance","data":{}}"#).is_err());
    }

    #[test]
    fn failure_kind_prefers_explicit_kind() {
        let result = CommandResult {
            command_id: "c1".to_string(),
            status: ResultStatus::Failed,
            result: None,
            error: Some("timeout while downloading".to_string()),
            error_kind: Some(FailureKind::PermissionDenied),
        };
        assert_eq!(result.failure_kind(), Some(FailureKind::PermissionDenied));

        let inferred = CommandResult {
            error_kind: None,
            ..result
        };
        assert_eq!(inferred.failure_kind(), Some(FailureKind::Timeout));
    }

    #[test]
    fn command_frame_shape() {
        let msg = OutboundMessage::Command(CommandEnvelope {
            id: "cmd-1".to_string(),
            command_type: CommandType::Reboot,
            data: serde_json::json!({}),
        });
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "command");
        assert_eq!(value["data"]["type"], "reboot");
        assert_eq!(value["data"]["id"], "cmd-1");
    }
}
