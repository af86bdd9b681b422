use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use std::collections::HashMap;
use uuid::Uuid;

/// Ephemeral presence payload for one connection. Never persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessPayload {
    pub user: String,
    pub name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorRange>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

/// Compact summary of the client's known state: highest seq per peer.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestMessage {
    #[serde(default)]
    pub version: HashMap<u64, u32>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    #[serde_as(as = "Base64")]
    pub update: Vec<u8>,
}

/// Presence update; `None` clears this connection's entry.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessMessage {
    pub payload: Option<AwarenessPayload>,
}

/// Messages a client may send.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "syncRequest")]
    SyncRequest(SyncRequestMessage),
    #[serde(rename = "update")]
    Update(UpdateMessage),
    #[serde(rename = "awareness")]
    Awareness(AwarenessMessage),
    #[serde(rename = "ping")]
    Ping,
}

/// First message on a fresh join: full snapshot plus the peer id assigned to
/// this connection for its own edits.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    pub peer_id: u64,
    #[serde_as(as = "Base64")]
    pub snapshot: Vec<u8>,
    pub version: HashMap<u64, u32>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SyncDeltaMessage {
    #[serde_as(as = "Base64")]
    pub update: Vec<u8>,
}

/// Presence diff for one connection; `payload: None` announces removal.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessBroadcast {
    pub conn_id: Uuid,
    pub payload: Option<AwarenessPayload>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessEntry {
    pub conn_id: Uuid,
    pub payload: AwarenessPayload,
}

/// Full presence map, sent once to each new joiner.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessStateMessage {
    pub entries: Vec<AwarenessEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PongMessage {
    pub date: String,
}

/// Messages the server may send.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "init")]
    Init(InitMessage),
    #[serde(rename = "syncDelta")]
    SyncDelta(SyncDeltaMessage),
    #[serde(rename = "update")]
    Update(UpdateMessage),
    #[serde(rename = "awareness")]
    Awareness(AwarenessBroadcast),
    #[serde(rename = "awarenessState")]
    AwarenessState(AwarenessStateMessage),
    #[serde(rename = "pong")]
    Pong(PongMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_from_tagged_json() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"update","update":"aGVsbG8="}"#).unwrap();
        match msg {
            ClientMessage::Update(u) => assert_eq!(u.update, b"hello"),
            other => panic!("unexpected message: {:?}", other),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"awareness","payload":null}"#).unwrap();
        match msg {
            ClientMessage::Awareness(a) => assert!(a.payload.is_none()),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn malformed_message_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }
}
