//! A small in-memory key/value [`Service`] used as a worked example and as
//! the state machine driving the integration tests. Not part of the public
//! contract the way `session`/`apply`/`client` are — a deployment supplies
//! its own [`Service`] implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::entry::Operation;
use crate::ids::SessionId;
use crate::service::CommandOutcome;
use crate::service::Event;
use crate::service::EventTarget;
use crate::service::Service;

/// `Put`/`Delete` mutate state and broadcast a change notification to every
/// open session of the service; `Get` is read-only.
#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, Vec<u8>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Service for KvStore {
    async fn open_session(&mut self, _index: u64, _ts: u64, _session_id: SessionId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close_session(&mut self, _index: u64, _ts: u64, _session_id: SessionId) {}

    async fn on_expire(&mut self, _index: u64, _ts: u64, _session_id: SessionId) -> Vec<Event> {
        Vec::new()
    }

    async fn apply_command(&mut self, _index: u64, _ts: u64, _session_id: SessionId, op: &Operation) -> CommandOutcome {
        match op.id.name.as_str() {
            "put" => match decode_put(&op.payload) {
                Ok((key, value)) => {
                    self.data.insert(key.clone(), value.clone());
                    CommandOutcome::ok(Vec::new()).with_events(vec![Event {
                        target: EventTarget::Broadcast,
                        payload: encode_change(&key, Some(&value)),
                    }])
                }
                Err(msg) => CommandOutcome::err(msg),
            },
            "delete" => {
                let key = String::from_utf8_lossy(&op.payload).into_owned();
                let existed = self.data.remove(&key).is_some();
                if existed {
                    CommandOutcome::ok(Vec::new()).with_events(vec![Event {
                        target: EventTarget::Broadcast,
                        payload: encode_change(&key, None),
                    }])
                } else {
                    CommandOutcome::ok(Vec::new())
                }
            }
            other => CommandOutcome::err(format!("unknown command {:?}", other)),
        }
    }

    async fn apply_query(&self, _ts: u64, op: &Operation) -> Result<Vec<u8>, String> {
        match op.id.name.as_str() {
            "get" => {
                let key = String::from_utf8_lossy(&op.payload).into_owned();
                Ok(self.data.get(&key).cloned().unwrap_or_default())
            }
            other => Err(format!("unknown query {:?}", other)),
        }
    }

    async fn snapshot(&self, _index: u64) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.data)?)
    }

    async fn restore(&mut self, _index: u64, bytes: &[u8]) -> anyhow::Result<()> {
        self.data = serde_json::from_slice(bytes)?;
        Ok(())
    }
}

fn decode_put(payload: &[u8]) -> Result<(String, Vec<u8>), String> {
    serde_json::from_slice::<(String, Vec<u8>)>(payload).map_err(|e| format!("malformed put payload: {e}"))
}

fn encode_change(key: &str, value: Option<&[u8]>) -> Vec<u8> {
    serde_json::to_vec(&(key, value)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::OperationId;

    fn put(key: &str, value: &[u8]) -> Operation {
        Operation {
            id: OperationId::command("put"),
            payload: serde_json::to_vec(&(key.to_string(), value.to_vec())).unwrap(),
        }
    }

    fn get(key: &str) -> Operation {
        Operation {
            id: OperationId::query("get"),
            payload: key.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let mut store = KvStore::new();
        let outcome = store.apply_command(1, 0, SessionId(1), &put("a", b"1")).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.events.len(), 1);

        let value = store.apply_query(0, &get("a")).await.unwrap();
        assert_eq!(value, b"1");
    }

    #[tokio::test]
    async fn delete_of_missing_key_is_a_no_op() {
        let mut store = KvStore::new();
        let outcome = store
            .apply_command(
                1,
                0,
                SessionId(1),
                &Operation {
                    id: OperationId::command("delete"),
                    payload: b"missing".to_vec(),
                },
            )
            .await;
        assert!(outcome.result.is_ok());
        assert!(outcome.events.is_empty());
    }

    #[tokio::test]
    async fn snapshot_restore_round_trips() {
        let mut store = KvStore::new();
        store.apply_command(1, 0, SessionId(1), &put("a", b"1")).await;
        let bytes = store.snapshot(1).await.unwrap();

        let mut restored = KvStore::new();
        restored.restore(1, &bytes).await.unwrap();
        let value = restored.apply_query(0, &get("a")).await.unwrap();
        assert_eq!(value, b"1");
    }
}
