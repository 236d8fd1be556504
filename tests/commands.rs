//! Command queue round trips through the in-memory broker

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use scp_hub::api;
use scp_hub::commands::{
    ActionKind, ActionRegistry, CommandConsumer, CommandPublisher, ConsumerConfig, ConsumerState,
    DeviceToolset, MemoryBroker, QueueSink, QueueSpec,
};
use scp_hub::registry::{BackendServer, ServerKind};
use scp_hub::results::{MemoryBackend, ResultBridge, ResultStore};
use scp_hub::tools::{HttpToolClient, ToolClient};
use scp_hub::Error;

const QUEUE: &str = "scp_commands_test";

struct Harness {
    broker: MemoryBroker,
    results: Arc<ResultStore>,
    publisher: Arc<CommandPublisher>,
    consumer: Arc<CommandConsumer>,
    shutdown: CancellationToken,
}

impl Harness {
    fn new(actions: ActionRegistry) -> Self {
        let broker = MemoryBroker::new();
        let results = Arc::new(ResultStore::new(Arc::new(MemoryBackend::new())));
        let queue = QueueSpec::durable(QUEUE);

        let publisher = Arc::new(CommandPublisher::new(
            Arc::new(QueueSink::new(Arc::new(broker.clone()), queue.clone())),
            results.clone(),
        ));

        let mut config = ConsumerConfig::new(queue);
        config.retry_interval = Duration::from_millis(50);
        let consumer = Arc::new(CommandConsumer::new(
            Arc::new(broker.clone()),
            Arc::new(actions),
            results.clone(),
            config,
        ));

        Self {
            broker,
            results,
            publisher,
            consumer,
            shutdown: CancellationToken::new(),
        }
    }

    fn start(&self) -> tokio::task::JoinHandle<scp_hub::Result<()>> {
        let consumer = self.consumer.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    }

    async fn wait_until_consuming(&self) {
        let mut state = self.consumer.state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConsumerState::Consuming),
        )
        .await
        .expect("consumer never started")
        .expect("state channel closed");
    }
}

#[tokio::test]
async fn ping_round_trip() {
    let harness = Harness::new(ActionRegistry::echo("lab1"));
    let task = harness.start();

    let request_id = harness
        .publisher
        .send("lab1", "ping", Map::new())
        .await
        .unwrap();
    let result = harness
        .publisher
        .wait_for_result(&request_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, Some(json!([{"ok": true}])));
    assert!(harness.publisher.pending(&request_id).await.unwrap().completed);

    let missing = harness
        .publisher
        .wait_for_result("unknown-id", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(missing, None);

    harness.shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn failing_handler_is_redelivered_and_stored_once() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let actions = ActionRegistry::new("lab1").with_action(
        ActionKind::Device,
        "flaky",
        "fails on the first attempt",
        json!({"type": "object"}),
        {
            let attempts = attempts.clone();
            move |_| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(Error::Handler("instrument busy".to_string()))
                    } else {
                        Ok(json!({"attempt": attempt}))
                    }
                }
            }
        },
    );
    let harness = Harness::new(actions);
    let task = harness.start();

    let request_id = harness
        .publisher
        .send("lab1", "flaky", Map::new())
        .await
        .unwrap();
    let result = harness
        .publisher
        .wait_for_result(&request_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, Some(json!([{"attempt": 1}])));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        harness.results.get(&request_id).await.unwrap(),
        Some(json!([{"attempt": 1}]))
    );
    assert_eq!(harness.broker.depth(QUEUE).await, 0);

    harness.shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_action_is_reported_not_retried() {
    let harness = Harness::new(ActionRegistry::echo("lab1"));
    let task = harness.start();

    let request_id = harness
        .publisher
        .send("lab1", "explode", Map::new())
        .await
        .unwrap();
    let result = harness
        .publisher
        .wait_for_result(&request_id, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result[0]["messageStatus"], -1);
    assert_eq!(result[0]["requestId"], Value::String(request_id));

    harness.shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn consumer_reconnects_after_disconnect() {
    let harness = Harness::new(ActionRegistry::echo("lab1"));
    let task = harness.start();
    harness.wait_until_consuming().await;

    harness.broker.refuse_connections(2);
    harness.broker.disconnect_all();

    let mut state = harness.consumer.state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| matches!(s, ConsumerState::Reconnecting { .. })),
    )
    .await
    .expect("consumer never noticed the disconnect")
    .unwrap();
    harness.wait_until_consuming().await;

    let request_id = harness
        .publisher
        .send("lab1", "echo", Map::from_iter([("v".to_string(), json!(7))]))
        .await
        .unwrap();
    let result = harness
        .publisher
        .wait_for_result(&request_id, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result[0]["v"], 7);

    harness.shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn worker_endpoint_serves_device_tools() {
    let harness = Harness::new(ActionRegistry::echo("lab1"));
    let task = harness.start();

    let toolset = Arc::new(
        DeviceToolset::new(
            Arc::new(ActionRegistry::echo("lab1")),
            harness.publisher.clone(),
        )
        .with_wait(Duration::from_secs(5)),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(api::serve(
        listener,
        api::worker::router(toolset),
        harness.shutdown.clone(),
    ));

    let worker = BackendServer {
        name: "lab1".to_string(),
        url: "http://127.0.0.1".to_string(),
        port,
        description: "echo device".to_string(),
        kind: ServerKind::Direct,
    };
    let client = HttpToolClient::new();

    let tools = client.list_tools(&worker).await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["ping", "echo"]);

    let content = client.call_tool(&worker, "ping", Map::new()).await.unwrap();
    let text = content[0]["text"].as_str().unwrap();
    let reply: Value = serde_json::from_str(text).unwrap();
    assert_eq!(reply["messageStatus"], 1);

    let content = client
        .call_tool(
            &worker,
            "ping",
            Map::from_iter([("async_flag".to_string(), json!(true))]),
        )
        .await
        .unwrap();
    let reply: Value = serde_json::from_str(content[0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(reply["messageStatus"], 2);
    assert!(reply["requestId"].is_string());

    harness.shutdown.cancel();
    server.await.unwrap().unwrap();
    task.await.unwrap().unwrap();
}
