//! Wire protocol for the persistent device transport
//!
//! JSON envelopes with a `type` discriminator, exchanged over the
//! device WebSocket. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

/// Incoming message from a device
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// Identify this connection; creates the device on first sight
    #[serde(rename_all = "camelCase")]
    Register {
        uuid: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },
    /// Periodic liveness signal from a registered device
    #[serde(rename_all = "camelCase")]
    Heartbeat { device_id: String },
    /// Execution outcome for a previously delivered command
    #[serde(rename_all = "camelCase")]
    CommandResult {
        command_id: String,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Outgoing message to a device
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// Sent on raw accept, before registration
    Connected,
    /// Registration succeeded; carries the assigned device id
    #[serde(rename_all = "camelCase")]
    Registered { device_id: String },
    /// Heartbeat acknowledged
    HeartbeatAck,
    /// Command delivery
    #[serde(rename_all = "camelCase")]
    Command {
        command_id: String,
        command_name: String,
        params: serde_json::Value,
    },
    /// Protocol or validation failure; the connection stays open
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_envelope_decodes() {
        let msg: DeviceMessage = serde_json::from_str(
            r#"{"type":"register","uuid":"abc","name":"TV1","metadata":{"os":"android"}}"#,
        )
        .unwrap();

        match msg {
            DeviceMessage::Register { uuid, name, metadata } => {
                assert_eq!(uuid, "abc");
                assert_eq!(name.as_deref(), Some("TV1"));
                assert_eq!(metadata.unwrap()["os"], "android");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_uses_camel_case_device_id() {
        let msg: DeviceMessage =
            serde_json::from_str(r#"{"type":"heartbeat","deviceId":"d-1"}"#).unwrap();
        assert!(matches!(msg, DeviceMessage::Heartbeat { device_id } if device_id == "d-1"));
    }

    #[test]
    fn command_result_fields_optional() {
        let msg: DeviceMessage =
            serde_json::from_str(r#"{"type":"command_result","commandId":"c-1"}"#).unwrap();
        match msg {
            DeviceMessage::CommandResult { command_id, result, error } => {
                assert_eq!(command_id, "c-1");
                assert!(result.is_none());
                assert!(error.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn command_envelope_shape() {
        let out = GatewayMessage::Command {
            command_id: "c-1".to_string(),
            command_name: "play_video".to_string(),
            params: serde_json::json!({"url": "https://example.com/v.mp4"}),
        };

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&out).unwrap()).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["commandId"], "c-1");
        assert_eq!(json["commandName"], "play_video");
        assert_eq!(json["params"]["url"], "https://example.com/v.mp4");
    }

    #[test]
    fn unit_envelopes_have_only_type() {
        let json = serde_json::to_string(&GatewayMessage::Connected).unwrap();
        assert_eq!(json, r#"{"type":"connected"}"#);

        let json = serde_json::to_string(&GatewayMessage::HeartbeatAck).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat_ack"}"#);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let parsed: Result<DeviceMessage, _> =
            serde_json::from_str(r#"{"type":"selfdestruct"}"#);
        assert!(parsed.is_err());
    }
}
