mod fixtures;

use std::sync::Arc;

use fixtures::Node;
use fixtures::SingleNodeTransport;
use replikit::client::ClusterTransport;
use replikit::client::CommandRequest;
use replikit::client::RegisterRequest;
use replikit::demo_kv::KvStore;
use replikit::entry::Operation;
use replikit::entry::ReadConsistency;
use replikit::ids::ClientId;
use replikit::ids::MemberId;
use replikit::ids::OperationId;

fn factory() -> Arc<dyn replikit::ServiceFactory> {
    Arc::new(|service_type: &str| -> Option<Box<dyn replikit::Service>> {
        match service_type {
            "kv" => Some(Box::new(KvStore::new())),
            _ => None,
        }
    })
}

fn put(key: &str, value: &[u8]) -> Operation {
    Operation {
        id: OperationId::command("put"),
        payload: serde_json::to_vec(&(key.to_string(), value.to_vec())).unwrap(),
    }
}

#[tokio::test]
async fn replaying_a_committed_sequence_returns_the_cached_result() {
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
                timeout_ms: 10_000,
            },
        )
        .await
        .unwrap();

    let first = transport
        .submit_command(
            MemberId(1),
            CommandRequest {
                session_id: reg.session_id,
                sequence: 1,
                version: 0,
                op: put("a", b"1"),
            },
        )
        .await
        .unwrap();
    assert!(first.outcome.is_ok());

    let replayed = transport
        .submit_command(
            MemberId(1),
            CommandRequest {
                session_id: reg.session_id,
                sequence: 1,
                version: 0,
                op: put("a", b"1"),
            },
        )
        .await
        .unwrap();

    assert_eq!(first, replayed, "a replayed sequence must return the identical cached result");
}

#[tokio::test]
async fn a_sequence_gap_is_reported_as_an_application_error_not_a_fatal_error() {
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
                timeout_ms: 10_000,
            },
        )
        .await
        .unwrap();

    // Skip sequence 1 entirely.
    let result = transport
        .submit_command(
            MemberId(1),
            CommandRequest {
                session_id: reg.session_id,
                sequence: 2,
                version: 0,
                op: put("a", b"1"),
            },
        )
        .await
        .unwrap();

    assert!(result.outcome.is_err(), "a sequence gap must surface as an operation error");

    // The applier itself must still be alive and able to process the correct sequence.
    let result = transport
        .submit_command(
            MemberId(1),
            CommandRequest {
                session_id: reg.session_id,
                sequence: 1,
                version: 0,
                op: put("a", b"1"),
            },
        )
        .await
        .unwrap();
    assert!(result.outcome.is_ok());
}
