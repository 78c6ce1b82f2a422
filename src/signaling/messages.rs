//! Message Types für das Signaling-Protokoll
//!
//! Diese Strukturen bilden die JSON-Umschläge ab, die zwei CallEngines über
//! den Relay austauschen. Alle Varianten sind ein geschlossener Enum, damit
//! der Dispatch in der CallEngine jede Variante behandeln muss.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

// ============================================================================
// CALL IDS
// ============================================================================

const CALL_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const CALL_ID_SUFFIX_LEN: usize = 9;

/// Erzeugt eine neue Call-ID im Format `call_<unix-millis>_<base36>`
pub fn generate_call_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..CALL_ID_SUFFIX_LEN)
        .map(|_| CALL_ID_ALPHABET[rng.gen_range(0..CALL_ID_ALPHABET.len())] as char)
        .collect();

    format!("call_{}_{}", Utc::now().timestamp_millis(), suffix)
}

// ============================================================================
// CALL CONTROL
// ============================================================================

/// Art des Anrufs, wird im `call-request` mitgeschickt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Video,
    Audio,
}

/// Payload der Call-Control Umschläge (request/accepted/rejected/ended)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallControl {
    #[serde(rename = "callId")]
    pub call_id: String,

    #[serde(
        rename = "targetUserId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_user_id: Option<String>,

    /// Absender; die CallEngine setzt ihn selbst, ein Relay darf ihn überschreiben
    #[serde(rename = "fromUserId", default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,

    #[serde(rename = "callType", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<CallType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default)]
    pub timestamp: i64,
}

impl CallControl {
    pub fn new(call_id: impl Into<String>, target_user_id: Option<String>) -> Self {
        Self {
            call_id: call_id.into(),
            target_user_id,
            from_user_id: None,
            call_type: None,
            reason: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_from_user_id(mut self, from_user_id: Option<String>) -> Self {
        self.from_user_id = from_user_id;
        self
    }

    pub fn with_call_type(mut self, call_type: CallType) -> Self {
        self.call_type = Some(call_type);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

// ============================================================================
// SESSION DESCRIPTION / ICE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// SDP wie es im Browser als `RTCSessionDescriptionInit` aussieht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im `RTCIceCandidateInit` Format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,

    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,

    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

// ============================================================================
// WEBRTC SIGNALING
// ============================================================================

/// Innerer Payload von `webrtc-signaling`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WebRtcSignal {
    Offer {
        offer: SessionDescription,
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "targetUserId", default)]
        target_user_id: String,
        #[serde(rename = "fromUserId", default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },

    Answer {
        answer: SessionDescription,
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "targetUserId", default)]
        target_user_id: String,
        #[serde(rename = "fromUserId", default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },

    IceCandidate {
        candidate: IceCandidate,
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "targetUserId", default)]
        target_user_id: String,
        #[serde(rename = "fromUserId", default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },
}

impl WebRtcSignal {
    pub fn call_id(&self) -> &str {
        match self {
            WebRtcSignal::Offer { call_id, .. }
            | WebRtcSignal::Answer { call_id, .. }
            | WebRtcSignal::IceCandidate { call_id, .. } => call_id,
        }
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Alle Signaling-Umschläge
///
/// Wire-Format: `{ "type": "<variante>", "data": { ... } }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalingMessage {
    CallRequest(CallControl),
    CallAccepted(CallControl),
    CallRejected(CallControl),
    CallEnded(CallControl),
    #[serde(rename = "webrtc-signaling")]
    WebRtcSignaling(WebRtcSignal),
}

impl SignalingMessage {
    pub fn call_id(&self) -> &str {
        match self {
            SignalingMessage::CallRequest(c)
            | SignalingMessage::CallAccepted(c)
            | SignalingMessage::CallRejected(c)
            | SignalingMessage::CallEnded(c) => &c.call_id,
            SignalingMessage::WebRtcSignaling(signal) => signal.call_id(),
        }
    }

    /// Name des Umschlags für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::CallRequest(_) => "call-request",
            SignalingMessage::CallAccepted(_) => "call-accepted",
            SignalingMessage::CallRejected(_) => "call-rejected",
            SignalingMessage::CallEnded(_) => "call-ended",
            SignalingMessage::WebRtcSignaling(WebRtcSignal::Offer { .. }) => "offer",
            SignalingMessage::WebRtcSignaling(WebRtcSignal::Answer { .. }) => "answer",
            SignalingMessage::WebRtcSignaling(WebRtcSignal::IceCandidate { .. }) => {
                "ice-candidate"
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_id_format() {
        let call_id = generate_call_id();
        let parts: Vec<&str> = call_id.split('_').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "call");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));

        assert_ne!(generate_call_id(), generate_call_id());
    }

    #[test]
    fn test_call_request_wire_format() {
        let msg = SignalingMessage::CallRequest(
            CallControl::new("call_1_abc", Some("user42".to_string()))
                .with_call_type(CallType::Video),
        );

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "call-request");
        assert_eq!(value["data"]["callId"], "call_1_abc");
        assert_eq!(value["data"]["targetUserId"], "user42");
        assert_eq!(value["data"]["callType"], "video");
        assert!(value["data"]["timestamp"].as_i64().unwrap() > 0);
        // Optionale Felder werden weggelassen
        assert!(value["data"].get("reason").is_none());
        assert!(value["data"].get("fromUserId").is_none());
    }

    #[test]
    fn test_offer_wire_format() {
        let msg = SignalingMessage::WebRtcSignaling(WebRtcSignal::Offer {
            offer: SessionDescription::offer("v=0"),
            call_id: "call_1_abc".to_string(),
            target_user_id: "user42".to_string(),
            from_user_id: None,
        });

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "webrtc-signaling",
                "data": {
                    "type": "offer",
                    "offer": { "type": "offer", "sdp": "v=0" },
                    "callId": "call_1_abc",
                    "targetUserId": "user42"
                }
            })
        );
    }

    #[test]
    fn test_parse_relayed_ice_candidate() {
        let raw = json!({
            "type": "webrtc-signaling",
            "data": {
                "type": "ice-candidate",
                "candidate": {
                    "candidate": "candidate:1 1 UDP 2122252543 192.168.1.2 50000 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                },
                "callId": "call_9_xyz",
                "targetUserId": "me",
                "fromUserId": "user42"
            }
        });

        let msg: SignalingMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.call_id(), "call_9_xyz");
        assert_eq!(msg.kind(), "ice-candidate");

        match msg {
            SignalingMessage::WebRtcSignaling(WebRtcSignal::IceCandidate {
                candidate,
                from_user_id,
                ..
            }) => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert_eq!(from_user_id.as_deref(), Some("user42"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = json!({ "type": "vehicle-update", "data": { "id": 7 } });
        assert!(serde_json::from_value::<SignalingMessage>(raw).is_err());
    }
}
