// notifications/codec.rs - Notification Flag Codecs

use super::NotificationError;

/// How a notification flag is keyed and encoded in the flag store
pub trait FlagCodec: Send + Sync + 'static {
    type Value: Clone + Send + Sync + std::fmt::Debug;

    /// Prefix prepended to the agent DID
    const KEY_PREFIX: &'static str;

    fn encode(value: &Self::Value) -> String;

    fn decode(raw: &str) -> Result<Self::Value, NotificationError>;

    /// Whether a stored value means "there is something unacknowledged"
    fn is_pending(value: &Self::Value) -> bool;

    fn key(agent_did: &str) -> String {
        format!("{}{}", Self::KEY_PREFIX, agent_did)
    }
}

/// V1: a plain boolean flag
#[derive(Debug, Clone, Copy)]
pub struct UnackedFlag;

impl FlagCodec for UnackedFlag {
    type Value = bool;

    const KEY_PREFIX: &'static str = "notifications:v1:";

    fn encode(value: &bool) -> String {
        value.to_string()
    }

    fn decode(raw: &str) -> Result<bool, NotificationError> {
        raw.parse()
            .map_err(|_| NotificationError::Codec(format!("not a boolean flag: {raw}")))
    }

    fn is_pending(value: &bool) -> bool {
        *value
    }
}

/// V2: unix time in milliseconds of the last unacknowledged message
#[derive(Debug, Clone, Copy)]
pub struct UnackedSince;

impl FlagCodec for UnackedSince {
    type Value = i64;

    const KEY_PREFIX: &'static str = "notifications:v2:";

    fn encode(value: &i64) -> String {
        value.to_string()
    }

    fn decode(raw: &str) -> Result<i64, NotificationError> {
        raw.parse()
            .map_err(|_| NotificationError::Codec(format!("not a timestamp: {raw}")))
    }

    fn is_pending(_: &i64) -> bool {
        true
    }
}
