// messages.rs - Agency Wire Messages
//
//! JSON messages exchanged with the agency, tagged by `@type`.
//!
//! Parsing distinguishes an unknown `@type` ([`AgencyError::UnknownMessageType`])
//! from a known type with a bad body ([`AgencyError::MalformedMessage`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgencyError;

pub const CONNECT: &str = "did:sov:123456789abcdefghi1234;spec/onboarding/1.0/CONNECT";
pub const CONNECTED: &str = "did:sov:123456789abcdefghi1234;spec/onboarding/1.0/CONNECTED";
pub const SIGNUP: &str = "did:sov:123456789abcdefghi1234;spec/onboarding/1.0/SIGNUP";
pub const SIGNED_UP: &str = "did:sov:123456789abcdefghi1234;spec/onboarding/1.0/SIGNED_UP";
pub const CREATE_AGENT: &str = "did:sov:123456789abcdefghi1234;spec/onboarding/1.0/CREATE_AGENT";
pub const AGENT_CREATED: &str = "did:sov:123456789abcdefghi1234;spec/onboarding/1.0/AGENT_CREATED";

pub const CREATE_KEY: &str = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/CREATE_KEY";
pub const KEY_CREATED: &str = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/KEY_CREATED";
pub const GET_MSGS: &str = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/GET_MSGS";
pub const MSGS: &str = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/MSGS";
pub const GET_MSGS_BY_CONNS: &str = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/GET_MSGS_BY_CONNS";
pub const MSGS_BY_CONNS: &str = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/MSGS_BY_CONNS";
pub const UPDATE_MSG_STATUS: &str = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/UPDATE_MSG_STATUS";
pub const MSG_STATUS_UPDATED: &str = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/MSG_STATUS_UPDATED";
pub const UPDATE_MSG_STATUS_BY_CONNS: &str =
    "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/UPDATE_MSG_STATUS_BY_CONNS";
pub const MSG_STATUS_UPDATED_BY_CONNS: &str =
    "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/MSG_STATUS_UPDATED_BY_CONNS";

pub const UPDATE_COM_METHOD: &str = "did:sov:123456789abcdefghi1234;spec/configs/1.0/UPDATE_COM_METHOD";
pub const COM_METHOD_UPDATED: &str = "did:sov:123456789abcdefghi1234;spec/configs/1.0/COM_METHOD_UPDATED";

pub const FORWARD: &str = "did:sov:123456789abcdefghi1234;spec/routing/1.0/FORWARD";
pub const ARIES_FORWARD: &str = "https://didcomm.org/routing/1.0/forward";
pub const ARIES_FORWARD_LEGACY: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/routing/1.0/forward";

/// Status of a freshly stored message
pub const STATUS_RECEIVED: &str = "MS-103";

/// Status of a message the owner has reviewed
pub const STATUS_REVIEWED: &str = "MS-106";

const KNOWN_TYPES: &[&str] = &[
    CONNECT,
    CONNECTED,
    SIGNUP,
    SIGNED_UP,
    CREATE_AGENT,
    AGENT_CREATED,
    CREATE_KEY,
    KEY_CREATED,
    GET_MSGS,
    MSGS,
    GET_MSGS_BY_CONNS,
    MSGS_BY_CONNS,
    UPDATE_MSG_STATUS,
    MSG_STATUS_UPDATED,
    UPDATE_MSG_STATUS_BY_CONNS,
    MSG_STATUS_UPDATED_BY_CONNS,
    UPDATE_COM_METHOD,
    COM_METHOD_UPDATED,
    FORWARD,
    ARIES_FORWARD,
    ARIES_FORWARD_LEGACY,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    #[serde(rename = "fromDID")]
    pub from_did: String,
    #[serde(rename = "fromDIDVerKey")]
    pub from_did_verkey: String,
}

/// Identity of a provisioned agent or agent-connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseIdentity {
    #[serde(rename = "withPairwiseDID")]
    pub did: String,
    #[serde(rename = "withPairwiseDIDVerKey")]
    pub verkey: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateKey {
    #[serde(rename = "forDID")]
    pub for_did: String,
    #[serde(rename = "forDIDVerKey")]
    pub for_did_verkey: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMsgs {
    #[serde(default)]
    pub uids: Vec<String>,
    #[serde(default)]
    pub status_codes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    pub uid: String,
    pub status_code: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Msgs {
    pub msgs: Vec<MessageEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMsgsByConns {
    #[serde(rename = "pairwiseDIDs", default)]
    pub pairwise_dids: Vec<String>,
    #[serde(default)]
    pub uids: Vec<String>,
    #[serde(default)]
    pub status_codes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMessages {
    #[serde(rename = "pairwiseDID")]
    pub pairwise_did: String,
    pub msgs: Vec<MessageEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgsByConns {
    pub msgs_by_conns: Vec<ConnectionMessages>,
}

/// Used for both the request and the reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgStatus {
    pub status_code: String,
    pub uids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseUids {
    #[serde(rename = "pairwiseDID")]
    pub pairwise_did: String,
    pub uids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMsgStatusByConns {
    pub status_code: String,
    pub uids_by_conns: Vec<PairwiseUids>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgStatusUpdatedByConns {
    pub status_code: String,
    pub updated_uids_by_conns: Vec<PairwiseUids>,
    pub failed_uids_by_conns: Vec<PairwiseUids>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: u32,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateComMethod {
    pub com_method: ComMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComMethodUpdated {
    pub id: String,
}

/// Legacy forward; `@msg` is an envelope sealed to the `@fwd` entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forward {
    #[serde(rename = "@fwd")]
    pub fwd: String,
    #[serde(rename = "@msg")]
    pub msg: Value,
}

/// Aries forward; `msg` is opaque to the agency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AriesForward {
    pub to: String,
    pub msg: Value,
}

/// Every message the agency reads or writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum AgencyMessage {
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/onboarding/1.0/CONNECT")]
    Connect(Connect),
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/onboarding/1.0/CONNECTED")]
    Connected(PairwiseIdentity),
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/onboarding/1.0/SIGNUP")]
    SignUp,
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/onboarding/1.0/SIGNED_UP")]
    SignedUp,
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/onboarding/1.0/CREATE_AGENT")]
    CreateAgent,
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/onboarding/1.0/AGENT_CREATED")]
    AgentCreated(PairwiseIdentity),

    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/CREATE_KEY")]
    CreateKey(CreateKey),
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/KEY_CREATED")]
    KeyCreated(PairwiseIdentity),
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/GET_MSGS")]
    GetMsgs(GetMsgs),
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/MSGS")]
    Msgs(Msgs),
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/GET_MSGS_BY_CONNS")]
    GetMsgsByConns(GetMsgsByConns),
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/MSGS_BY_CONNS")]
    MsgsByConns(MsgsByConns),
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/UPDATE_MSG_STATUS")]
    UpdateMsgStatus(MsgStatus),
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/MSG_STATUS_UPDATED")]
    MsgStatusUpdated(MsgStatus),
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/UPDATE_MSG_STATUS_BY_CONNS")]
    UpdateMsgStatusByConns(UpdateMsgStatusByConns),
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/pairwise/1.0/MSG_STATUS_UPDATED_BY_CONNS")]
    MsgStatusUpdatedByConns(MsgStatusUpdatedByConns),

    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/configs/1.0/UPDATE_COM_METHOD")]
    UpdateComMethod(UpdateComMethod),
    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/configs/1.0/COM_METHOD_UPDATED")]
    ComMethodUpdated(ComMethodUpdated),

    #[serde(rename = "did:sov:123456789abcdefghi1234;spec/routing/1.0/FORWARD")]
    Forward(Forward),
    #[serde(
        rename = "https://didcomm.org/routing/1.0/forward",
        alias = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/routing/1.0/forward"
    )]
    AriesForward(AriesForward),
}

impl AgencyMessage {
    /// Parse a message, classifying it by `@type` first
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AgencyError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| AgencyError::MalformedMessage(format!("not JSON: {e}")))?;

        let message_type = value
            .get("@type")
            .and_then(Value::as_str)
            .ok_or_else(|| AgencyError::MalformedMessage("missing @type".to_string()))?;

        if !KNOWN_TYPES.contains(&message_type) {
            return Err(AgencyError::UnknownMessageType(message_type.to_string()));
        }

        let message_type = message_type.to_string();
        serde_json::from_value(value)
            .map_err(|e| AgencyError::MalformedMessage(format!("{message_type}: {e}")))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, AgencyError> {
        serde_json::to_vec(self).map_err(|e| AgencyError::MalformedMessage(e.to_string()))
    }

    /// The `@type` this message serializes with
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Connect(_) => CONNECT,
            Self::Connected(_) => CONNECTED,
            Self::SignUp => SIGNUP,
            Self::SignedUp => SIGNED_UP,
            Self::CreateAgent => CREATE_AGENT,
            Self::AgentCreated(_) => AGENT_CREATED,
            Self::CreateKey(_) => CREATE_KEY,
            Self::KeyCreated(_) => KEY_CREATED,
            Self::GetMsgs(_) => GET_MSGS,
            Self::Msgs(_) => MSGS,
            Self::GetMsgsByConns(_) => GET_MSGS_BY_CONNS,
            Self::MsgsByConns(_) => MSGS_BY_CONNS,
            Self::UpdateMsgStatus(_) => UPDATE_MSG_STATUS,
            Self::MsgStatusUpdated(_) => MSG_STATUS_UPDATED,
            Self::UpdateMsgStatusByConns(_) => UPDATE_MSG_STATUS_BY_CONNS,
            Self::MsgStatusUpdatedByConns(_) => MSG_STATUS_UPDATED_BY_CONNS,
            Self::UpdateComMethod(_) => UPDATE_COM_METHOD,
            Self::ComMethodUpdated(_) => COM_METHOD_UPDATED,
            Self::Forward(_) => FORWARD,
            Self::AriesForward(_) => ARIES_FORWARD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_connect() {
        let bytes = serde_json::to_vec(&json!({
            "@type": CONNECT,
            "fromDID": "did1",
            "fromDIDVerKey": "verkey1",
        }))
        .unwrap();

        let message = AgencyMessage::from_slice(&bytes).unwrap();
        assert_eq!(
            message,
            AgencyMessage::Connect(Connect {
                from_did: "did1".to_string(),
                from_did_verkey: "verkey1".to_string(),
            })
        );
        assert_eq!(message.message_type(), CONNECT);
    }

    #[test]
    fn test_unit_message_roundtrip() {
        let bytes = AgencyMessage::SignUp.to_vec().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({ "@type": SIGNUP }));
        assert_eq!(AgencyMessage::from_slice(&bytes).unwrap(), AgencyMessage::SignUp);
    }

    #[test]
    fn test_unknown_type() {
        let bytes = br#"{"@type":"did:sov:123456789abcdefghi1234;spec/onboarding/1.0/LOGIN"}"#;
        assert!(matches!(
            AgencyMessage::from_slice(bytes),
            Err(AgencyError::UnknownMessageType(t)) if t.ends_with("LOGIN")
        ));
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(
            AgencyMessage::from_slice(b"not json"),
            Err(AgencyError::MalformedMessage(_))
        ));
        assert!(matches!(
            AgencyMessage::from_slice(br#"{"fromDID":"x"}"#),
            Err(AgencyError::MalformedMessage(_))
        ));
        // known type, missing field
        let bytes = serde_json::to_vec(&json!({ "@type": CREATE_KEY, "forDID": "x" })).unwrap();
        assert!(matches!(
            AgencyMessage::from_slice(&bytes),
            Err(AgencyError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_aries_forward_alias() {
        for message_type in [ARIES_FORWARD, ARIES_FORWARD_LEGACY] {
            let bytes = serde_json::to_vec(&json!({
                "@type": message_type,
                "to": "did1",
                "msg": { "protected": "abc" },
            }))
            .unwrap();

            let AgencyMessage::AriesForward(forward) = AgencyMessage::from_slice(&bytes).unwrap()
            else {
                panic!("expected an aries forward");
            };
            assert_eq!(forward.to, "did1");
            assert_eq!(forward.msg, json!({ "protected": "abc" }));
        }
    }

    #[test]
    fn test_optional_filters_default_to_empty() {
        let bytes = serde_json::to_vec(&json!({ "@type": GET_MSGS_BY_CONNS })).unwrap();
        assert_eq!(
            AgencyMessage::from_slice(&bytes).unwrap(),
            AgencyMessage::GetMsgsByConns(GetMsgsByConns::default())
        );
    }

    #[test]
    fn test_wire_field_names() {
        let reply = AgencyMessage::MsgStatusUpdatedByConns(MsgStatusUpdatedByConns {
            status_code: STATUS_REVIEWED.to_string(),
            updated_uids_by_conns: vec![PairwiseUids {
                pairwise_did: "pw1".to_string(),
                uids: vec!["u1".to_string()],
            }],
            failed_uids_by_conns: vec![],
        });
        let value: Value = serde_json::from_slice(&reply.to_vec().unwrap()).unwrap();

        assert_eq!(value["statusCode"], "MS-106");
        assert_eq!(value["updatedUidsByConns"][0]["pairwiseDID"], "pw1");
        assert_eq!(value["failedUidsByConns"], json!([]));
    }
}
