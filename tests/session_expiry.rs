mod fixtures;

use std::sync::Arc;

use fixtures::Node;
use fixtures::SingleNodeTransport;
use replikit::client::ClusterTransport;
use replikit::client::CommandRequest;
use replikit::client::RegisterRequest;
use replikit::demo_kv::KvStore;
use replikit::entry::EntryPayload;
use replikit::entry::Operation;
use replikit::entry::ReadConsistency;
use replikit::ids::ClientId;
use replikit::ids::MemberId;
use replikit::ids::OperationId;
use replikit::error::OperationError;
use replikit::CommittedLog;

fn factory() -> Arc<dyn replikit::ServiceFactory> {
    Arc::new(|service_type: &str| -> Option<Box<dyn replikit::Service>> {
        match service_type {
            "kv" => Some(Box::new(KvStore::new())),
            _ => None,
        }
    })
}

/// A stalled session is declared expired once a later entry's timestamp
/// outruns its `timeoutMs`, and a subsequent Command against it surfaces as
/// `UnknownSession` rather than silently applying.
#[tokio::test]
async fn a_stalled_session_expires_and_rejects_further_commands() {
    let node = Arc::new(Node::new(MemberId(1), factory()));
    let transport = SingleNodeTransport::new(node.clone());

    let reg = transport
        .register(
            MemberId(1),
            RegisterRequest {
                cluster_name: "test".into(),
                client_id: ClientId::generate(),
                service_name: "store".into(),
                service_type: "kv".into(),
                read_consistency: ReadConsistency::Linearizable,
                timeout_ms: 5,
            },
        )
        .await
        .unwrap();

    // Advance committed time far past the session's 5ms lease via an
    // unrelated KeepAlive entry for a different (nonexistent) session; any
    // entry advances the clock that `completeKeepAlive` checks against.
    for _ in 0..10 {
        node.log
            .append(EntryPayload::KeepAlive {
                session_ids: vec![],
                command_seqs: vec![],
                event_indexes: vec![],
            })
            .await;
    }
    let last = node.log.last_committed_index().await.unwrap();
    node.engine.apply(last).await.unwrap();

    let result = transport
        .submit_command(
            MemberId(1),
            CommandRequest {
                session_id: reg.session_id,
                sequence: 1,
                version: 0,
                op: Operation {
                    id: OperationId::command("put"),
                    payload: serde_json::to_vec(&("a".to_string(), b"1".to_vec())).unwrap(),
                },
            },
        )
        .await
        .unwrap();

    assert!(
        matches!(result.outcome, Err(OperationError::UnknownSession(id)) if id == reg.session_id),
        "a command against an expired session must surface UnknownSession, not apply silently"
    );
}
