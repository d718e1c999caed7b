mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use fixtures::Node;
use fixtures::SingleNodeTransport;
use replikit::client::DispatcherHandle;
use replikit::config::Config;
use replikit::demo_kv::KvStore;
use replikit::entry::Operation;
use replikit::entry::ReadConsistency;
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

async fn dispatcher(node: Arc<Node>) -> DispatcherHandle {
    let config = Config::build("test-cluster")
        .keep_alive_interval_ms(50)
        .validate()
        .unwrap();
    let transport = Arc::new(SingleNodeTransport::new(node.clone()));
    DispatcherHandle::new(
        config,
        transport,
        vec![node.id],
        "store",
        "kv",
        ReadConsistency::Linearizable,
        10_000,
    )
}

#[tokio::test]
async fn open_submit_and_query_round_trip() {
    let node = Arc::new(Node::new(MemberId(1), factory()));
    let client = dispatcher(node).await;

    client.open().await.expect("open must succeed against a reachable leader");

    let put = Operation {
        id: OperationId::command("put"),
        payload: serde_json::to_vec(&("a".to_string(), b"1".to_vec())).unwrap(),
    };
    let result = client.submit_command(put).await.expect("put must succeed");
    assert!(result.is_empty());

    let get = Operation {
        id: OperationId::query("get"),
        payload: b"a".to_vec(),
    };
    let value = client.submit_query(get).await.expect("get must succeed");
    assert_eq!(value, b"1");

    client.close().await.expect("close must succeed");
}

#[tokio::test]
async fn commands_are_rejected_before_open() {
    let node = Arc::new(Node::new(MemberId(1), factory()));
    let client = dispatcher(node).await;

    let put = Operation {
        id: OperationId::command("put"),
        payload: serde_json::to_vec(&("a".to_string(), b"1".to_vec())).unwrap(),
    };
    let err = client.submit_command(put).await.unwrap_err();
    assert!(matches!(err, replikit::DispatchError::NotOpen));
}

#[tokio::test]
async fn keep_alive_keeps_a_quiet_session_open() {
    let node = Arc::new(Node::new(MemberId(1), factory()));
    let client = dispatcher(node).await;
    client.open().await.unwrap();

    // Outlive several keep-alive ticks without submitting any commands.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let get = Operation {
        id: OperationId::query("get"),
        payload: b"missing".to_vec(),
    };
    let value = client.submit_query(get).await.expect("session must still be open");
    assert!(value.is_empty());
}
