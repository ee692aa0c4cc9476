use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MessengerError, Result};

/// Wire layout of a chat envelope. Field numbers are part of the
/// protocol shared with other clients on the network.
#[derive(Clone, PartialEq, Message)]
pub struct ChatMessage {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub room_id: Vec<u8>,
}

/// Decoded inbound event handed to subscription handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub timestamp: u64,
    pub room_id: String,
    pub body: Value,
}

pub fn encode(timestamp: u64, room_id: &str, body: &Value) -> Result<Vec<u8>> {
    let body =
        serde_json::to_vec(body).map_err(|e| MessengerError::Serialization(e.to_string()))?;
    let message = ChatMessage {
        timestamp,
        body,
        room_id: room_id.as_bytes().to_vec(),
    };
    Ok(message.encode_to_vec())
}

pub fn decode(bytes: &[u8]) -> Result<MessageEvent> {
    let message = ChatMessage::decode(bytes).map_err(|e| MessengerError::Decode(e.to_string()))?;
    let body: Value = serde_json::from_slice(&message.body)
        .map_err(|e| MessengerError::Decode(format!("body is not json: {e}")))?;
    let room_id = String::from_utf8(message.room_id)
        .map_err(|e| MessengerError::Decode(format!("room id is not utf-8: {e}")))?;
    Ok(MessageEvent {
        timestamp: message.timestamp,
        room_id,
        body,
    })
}
