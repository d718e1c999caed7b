mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use fixtures::Node;
use fixtures::SingleNodeTransport;
use replikit::client::ClusterTransport;
use replikit::client::CloseSessionRequest;
use replikit::client::CommandRequest;
use replikit::client::RegisterRequest;
use replikit::compactor::Compactor;
use replikit::demo_kv::KvStore;
use replikit::CommittedLog;
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

#[tokio::test]
async fn compaction_truncates_the_log_once_every_service_has_snapshotted() {
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

    transport
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

    transport
        .close_session(MemberId(1), CloseSessionRequest { session_id: reg.session_id })
        .await
        .unwrap();

    let before = node.log.last_committed_index().await.unwrap();
    assert!(before > 0);

    let compactor = Compactor::new(node.engine.clone(), Duration::from_millis(10));
    let report = compactor.tick().await.expect("compaction must succeed");

    assert_eq!(report.services_snapshotted, 1);
    assert_eq!(report.truncated_through, Some(before));

    // Entries at or below the compacted index must now read back as gone.
    assert!(node.log.read(before).await.unwrap().is_none());
}
