use blogmaster_common::{
    cache::{Change, Record},
    model::Id,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use uuid::Uuid;

/// Topic the socket-level heartbeat is sent on.
pub(crate) const PHOENIX_TOPIC: &str = "phoenix";

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Event {
    PhxJoin,
    PhxLeave,
    PhxReply,
    PhxError,
    PhxClose,
    Heartbeat,
    AccessToken,
    PostgresChanges,
    System,
    #[serde(other)]
    Other,
}

/// One message of the channel protocol, in either direction.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub topic: String,
    pub event: Event,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ReplyStatus {
    Ok,
    Error,
    #[serde(other)]
    Other,
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
pub(crate) struct ReplyPayload {
    pub status: ReplyStatus,
    #[serde(default)]
    pub response: Value,
}

/// Which rows of which table a channel listens to.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub(crate) struct ChangeFilter {
    pub table: &'static str,
    /// Row filter in the REST filter syntax, e.g. `post_id=eq.<id>`.
    pub rows: Option<String>,
}

impl ChangeFilter {
    pub fn join_payload(&self, access_token: &str) -> Value {
        let changes: Vec<Value> = ["INSERT", "DELETE"]
            .into_iter()
            .map(|event| {
                let mut change = json!({
                    "event": event,
                    "schema": "public",
                    "table": self.table,
                });
                if let Some(rows) = &self.rows {
                    change["filter"] = Value::String(rows.clone());
                }
                change
            })
            .collect();

        json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "private": false,
                "postgres_changes": changes,
            },
            "access_token": access_token,
        })
    }
}

#[derive(Deserialize)]
struct ChangesPayload {
    data: ChangeData,
}

#[derive(Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    record: Value,
    #[serde(default)]
    old_record: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Deserialize)]
struct DeletedRow {
    id: Uuid,
}

/// Decodes the payload of a `postgres_changes` frame.
///
/// Updates are not part of the model and decode to `None`.
pub(crate) fn decode_change<T>(payload: Value) -> Result<Option<Change<T>>, serde_json::Error>
where
    T: Record + DeserializeOwned,
{
    let ChangesPayload { data } = serde_json::from_value(payload)?;

    Ok(match data.kind {
        ChangeKind::Insert => Some(Change::Insert(serde_json::from_value(data.record)?)),
        ChangeKind::Delete => {
            let DeletedRow { id } = serde_json::from_value(data.old_record)?;
            Some(Change::Delete(Id::new(id)))
        }
        ChangeKind::Update => None,
    })
}
