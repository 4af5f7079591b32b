//! Message types for the LTI client-side storage postMessage protocol
//!
//! Wire shape: every message is a JSON object whose `subject` discriminates
//! the variant; data messages carry `message_id`, `key`, `value`, and
//! responses may carry an `error` object instead of a value.

use serde::{Deserialize, Serialize};

/// One entry of a capabilities response: the platform advertises which
/// subjects it supports and, for data subjects, in which frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedMessage {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
}

/// Error object a platform may attach to a data response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageError {
    pub code: String,
    pub message: String,
}

/// The postMessage family, discriminated by `subject`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subject")]
pub enum StorageMessage {
    /// Tool -> platform: what storage subjects do you support?
    #[serde(rename = "lti.capabilities")]
    Capabilities,

    /// Platform -> tool: advertised subjects and their frames.
    #[serde(rename = "lti.capabilities.response")]
    CapabilitiesResponse {
        supported_messages: Vec<SupportedMessage>,
    },

    /// Tool -> platform frame: store `key` = `value`.
    #[serde(rename = "lti.put_data")]
    PutData {
        message_id: String,
        key: String,
        value: String,
    },

    /// Platform frame -> tool: put acknowledged (or errored).
    #[serde(rename = "lti.put_data.response")]
    PutDataResponse {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<MessageError>,
    },

    /// Tool -> platform frame: fetch the stored value for `key`.
    #[serde(rename = "lti.get_data")]
    GetData { message_id: String, key: String },

    /// Platform frame -> tool: fetched value (or error).
    #[serde(rename = "lti.get_data.response")]
    GetDataResponse {
        message_id: String,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<MessageError>,
    },
}

impl StorageMessage {
    /// The wire `subject` string of this message.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Capabilities => "lti.capabilities",
            Self::CapabilitiesResponse { .. } => "lti.capabilities.response",
            Self::PutData { .. } => "lti.put_data",
            Self::PutDataResponse { .. } => "lti.put_data.response",
            Self::GetData { .. } => "lti.get_data",
            Self::GetDataResponse { .. } => "lti.get_data.response",
        }
    }
}

/// An outbound message plus the frame it must be posted to.
///
/// `frame: None` targets the parent window itself (the capability probe);
/// data messages target the frame the platform advertised.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub frame: Option<String>,
    pub message: StorageMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capabilities_probe_wire_shape() {
        let encoded = serde_json::to_value(&StorageMessage::Capabilities).unwrap();
        assert_eq!(encoded, json!({"subject": "lti.capabilities"}));
    }

    #[test]
    fn get_data_round_trip() {
        let msg = StorageMessage::GetData {
            message_id: "state_abc123".to_string(),
            key: "state".to_string(),
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: StorageMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(msg.subject(), "lti.get_data");
    }

    #[test]
    fn capabilities_response_parses_platform_shape() {
        let decoded: StorageMessage = serde_json::from_value(json!({
            "subject": "lti.capabilities.response",
            "supported_messages": [
                {"subject": "lti.capabilities"},
                {"subject": "lti.get_data", "frame": "post_message_forwarding"},
                {"subject": "lti.put_data", "frame": "post_message_forwarding"}
            ]
        }))
        .unwrap();
        match decoded {
            StorageMessage::CapabilitiesResponse { supported_messages } => {
                assert_eq!(supported_messages.len(), 3);
                assert_eq!(
                    supported_messages[1].frame.as_deref(),
                    Some("post_message_forwarding")
                );
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn response_error_object_parses() {
        let decoded: StorageMessage = serde_json::from_value(json!({
            "subject": "lti.get_data.response",
            "message_id": "nonce_abc",
            "key": "nonce",
            "error": {"code": "key_not_found", "message": "no such key"}
        }))
        .unwrap();
        match decoded {
            StorageMessage::GetDataResponse { value, error, .. } => {
                assert!(value.is_none());
                assert_eq!(error.unwrap().code, "key_not_found");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
