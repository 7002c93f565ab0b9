//! The message vocabulary of the client fan-out: JSON objects tagged by a
//! kebab-case `type`, with an optional opaque `id` echoed on replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::labels::LabelKey;
use crate::salvo::{Salvo, SalvoEntry};
use crate::state::CrosspointState;

/// One inbound client message: the request plus its reply token.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub request: ClientRequest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientRequest {
    TakeCrosspoint {
        #[serde(default)]
        matrix: u8,
        level: u8,
        destination: u16,
        source: u16,
    },
    TakeMultiLevel {
        #[serde(default)]
        matrix: u8,
        levels: Vec<u8>,
        destination: u16,
        source: u16,
    },
    QueryCrosspoint {
        #[serde(default)]
        matrix: u8,
        level: u8,
        destination: u16,
    },
    SetLabel {
        #[serde(flatten)]
        key: LabelKey,
        value: String,
    },
    GetLabel {
        #[serde(flatten)]
        key: LabelKey,
    },
    GetAllLabels,
    // The reply token already owns the `id` key, so salvos are referenced
    // by a `salvo` field.
    CreateSalvo {
        salvo: u32,
        name: String,
        crosspoints: Vec<SalvoEntry>,
    },
    ExecuteSalvo {
        salvo: u32,
    },
    GetAllSalvos,
    GetStatus,
    GetAllCrosspoints,
    GetCrosspointsByLevel {
        #[serde(default)]
        matrix: u8,
        level: u8,
    },
    Subscribe,
    Unsubscribe,
}

/// The `get-status` / `status-update` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub connected: bool,
    pub connection_type: String,
    pub crosspoint_count: usize,
    /// Milliseconds since the epoch of the newest cache entry; absent until
    /// the first tally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    #[serde(flatten)]
    pub key: LabelKey,
    pub value: String,
}

/// One outbound server message: broadcasts carry no `id`, query replies
/// echo the request's.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    CrosspointChange {
        crosspoint: CrosspointState,
    },
    LabelChange {
        #[serde(flatten)]
        key: LabelKey,
        value: String,
    },
    SalvoChange {
        salvo: Salvo,
    },
    RouterConnected,
    RouterDisconnected,
    RouterError {
        message: String,
    },
    StatusUpdate {
        #[serde(flatten)]
        status: Status,
    },
    /// Bulk snapshot, the reply to the crosspoint queries.
    CrosspointUpdate {
        crosspoints: Vec<CrosspointState>,
    },
    Crosspoint {
        crosspoint: Option<CrosspointState>,
    },
    Label {
        #[serde(flatten)]
        key: LabelKey,
        value: Option<String>,
    },
    Labels {
        labels: Vec<LabelRecord>,
    },
    Salvos {
        salvos: Vec<Salvo>,
    },
    Ack,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServerEnvelope {
    #[serde(flatten)]
    pub event: ServerEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl ServerEnvelope {
    pub fn broadcast(event: ServerEvent) -> ServerEnvelope {
        ServerEnvelope { event, id: None }
    }

    pub fn reply(event: ServerEvent, id: Option<Value>) -> ServerEnvelope {
        ServerEnvelope { event, id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelKind;

    #[test]
    fn take_crosspoint_with_reply_token() {
        let envelope: ClientEnvelope = serde_json::from_str(
            r#"{"type":"take-crosspoint","level":1,"destination":5,"source":10,"id":42}"#,
        )
        .unwrap();
        assert_eq!(envelope.id, Some(serde_json::json!(42)));
        assert_eq!(
            envelope.request,
            ClientRequest::TakeCrosspoint {
                matrix: 0,
                level: 1,
                destination: 5,
                source: 10,
            }
        );
    }

    #[test]
    fn label_key_uses_target() {
        let envelope: ClientEnvelope = serde_json::from_str(
            r#"{"type":"set-label","target":"source","index":3,"value":"CAM 3"}"#,
        )
        .unwrap();
        match envelope.request {
            ClientRequest::SetLabel { key, value } => {
                assert_eq!(key.kind, LabelKind::Source);
                assert_eq!(key.matrix, 0);
                assert_eq!(key.index, 3);
                assert_eq!(value, "CAM 3");
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn unknown_type_does_not_parse() {
        assert!(serde_json::from_str::<ClientEnvelope>(r#"{"type":"reboot-router"}"#).is_err());
    }

    #[test]
    fn status_update_shape() {
        let envelope = ServerEnvelope::reply(
            ServerEvent::StatusUpdate {
                status: Status {
                    connected: true,
                    connection_type: "tcp".into(),
                    crosspoint_count: 12,
                    last_update: None,
                },
            },
            Some(serde_json::json!("q1")),
        );
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(json["type"], "status-update");
        assert_eq!(json["connectionType"], "tcp");
        assert_eq!(json["crosspointCount"], 12);
        assert_eq!(json["id"], "q1");
        assert!(json.get("lastUpdate").is_none());
    }

    #[test]
    fn broadcast_has_no_id() {
        let envelope = ServerEnvelope::broadcast(ServerEvent::RouterConnected);
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            r#"{"type":"router-connected"}"#
        );
    }
}
