use loki_write::app::config::{EndpointConfig, EngineConfig};
use loki_write::buffer::{BackpressurePolicy, QueueError};
use loki_write::domain::{EndpointError, Entry, LabelSet, TENANT_LABEL, WriteError};
use loki_write::reliability::drop_reason;
use loki_write::sender::{PushRequest, decode_push_request};
use loki_write::Engine;
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const PUSH_PATH: &str = "/loki/api/v1/push";

async fn loki(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn endpoint(server: &MockServer, name: &str) -> EndpointConfig {
    let mut config = EndpointConfig::new(format!("{}{}", server.uri(), PUSH_PATH));
    config.name = Some(name.to_string());
    config.batch_wait = Duration::from_millis(10);
    config.retry.min_backoff = Duration::from_millis(10);
    config.retry.max_backoff = Duration::from_millis(20);
    config.retry.jitter = false;
    config.shutdown_grace = Duration::from_secs(2);
    config
}

fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    pairs.iter().copied().collect()
}

async fn wait_for_requests(server: &MockServer, count: usize) -> Vec<Request> {
    for _ in 0..300 {
        let requests = server.received_requests().await.unwrap_or_default();
        if requests.len() >= count {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server.received_requests().await.unwrap_or_default()
}

async fn wait_for_lines(server: &MockServer, count: usize) -> Vec<String> {
    for _ in 0..500 {
        let requests = server.received_requests().await.unwrap_or_default();
        let delivered = lines(&pushed(&requests));
        if delivered.len() >= count {
            return delivered;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    lines(&pushed(&server.received_requests().await.unwrap_or_default()))
}

fn pushed(requests: &[Request]) -> Vec<PushRequest> {
    requests
        .iter()
        .map(|r| decode_push_request(&r.body).unwrap())
        .collect()
}

fn lines(pushes: &[PushRequest]) -> Vec<String> {
    pushes
        .iter()
        .flat_map(|p| p.streams.iter())
        .flat_map(|s| s.entries.iter())
        .map(|e| e.line.clone())
        .collect()
}

#[tokio::test]
async fn time_trigger_delivers_one_batch_with_tenant() {
    let server = loki(204).await;
    let mut config = endpoint(&server, "primary");
    config.tenant_id = Some("tenant-1".to_string());
    config.max_in_flight = 1;

    let engine = Engine::start(EngineConfig::new(vec![config])).unwrap();
    let ingress = engine.ingress();
    let app = labels(&[("app", "api")]);
    ingress.send(Entry::now(app.clone(), "first")).await.unwrap();
    ingress.send(Entry::now(app, "second")).await.unwrap();

    wait_for_requests(&server, 1).await;
    engine.shutdown().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].headers.get("x-scope-orgid").unwrap(),
        "tenant-1"
    );

    let pushes = pushed(&requests);
    assert_eq!(pushes[0].streams.len(), 1);
    assert_eq!(pushes[0].streams[0].labels, r#"{app="api"}"#);
    assert_eq!(pushes[0].streams[0].entries.len(), 2);
    assert_eq!(lines(&pushes), vec!["first", "second"]);
}

#[tokio::test]
async fn fans_out_with_per_endpoint_labels() {
    let foo = loki(200).await;
    let bar = loki(200).await;

    let mut a = endpoint(&foo, "foo");
    a.external_labels = labels(&[("lbl", "foo")]);
    let mut b = endpoint(&bar, "bar");
    b.external_labels = labels(&[("lbl", "bar")]);

    let engine = Engine::start(EngineConfig::new(vec![a, b])).unwrap();
    engine
        .ingress()
        .send(Entry::now(labels(&[("app", "x")]), "shared line"))
        .await
        .unwrap();
    engine.shutdown().await.unwrap();

    let foo_push = pushed(&foo.received_requests().await.unwrap());
    let bar_push = pushed(&bar.received_requests().await.unwrap());
    assert_eq!(foo_push[0].streams[0].labels, r#"{app="x", lbl="foo"}"#);
    assert_eq!(bar_push[0].streams[0].labels, r#"{app="x", lbl="bar"}"#);
    assert_eq!(lines(&foo_push), vec!["shared line"]);
    assert_eq!(lines(&bar_push), vec!["shared line"]);
}

#[tokio::test]
async fn engine_labels_apply_below_endpoint_labels() {
    let server = loki(200).await;
    let mut config = endpoint(&server, "primary");
    config.external_labels = labels(&[("env", "endpoint")]);

    let mut engine_config = EngineConfig::new(vec![config]);
    engine_config.external_labels = labels(&[("env", "engine"), ("job", "agent")]);

    let engine = Engine::start(engine_config).unwrap();
    engine
        .ingress()
        .send(Entry::now(labels(&[("app", "x")]), "line"))
        .await
        .unwrap();
    engine.shutdown().await.unwrap();

    let push = pushed(&server.received_requests().await.unwrap());
    assert_eq!(
        push[0].streams[0].labels,
        r#"{app="x", env="endpoint", job="agent"}"#
    );
}

#[tokio::test]
async fn failing_endpoint_does_not_affect_healthy_one() {
    const ENTRIES: usize = 50;

    let broken = loki(500).await;
    let healthy = loki(200).await;

    let mut failing = endpoint(&broken, "broken");
    failing.retry.max_retries = 0;
    failing.batch_size = 1;
    failing.max_in_flight = 1;
    failing.max_pending_batches = 4;
    failing.queue.capacity = 4;
    failing.shutdown_grace = Duration::from_millis(300);

    let mut ok = endpoint(&healthy, "healthy");
    ok.batch_size = 1;
    ok.max_in_flight = 1;
    ok.queue.capacity = 4;

    let engine = Engine::start(EngineConfig::new(vec![failing, ok])).unwrap();
    let ingress = engine.ingress();
    for i in 0..ENTRIES {
        ingress
            .send(Entry::now(labels(&[("app", "x")]), format!("line {i}")))
            .await
            .unwrap();
    }

    let expected: Vec<String> = (0..ENTRIES).map(|i| format!("line {i}")).collect();
    assert_eq!(wait_for_lines(&healthy, ENTRIES).await, expected);
    assert!(!broken.received_requests().await.unwrap().is_empty());

    let metrics = engine.metrics().clone();
    let err = engine.shutdown().await.unwrap_err();
    assert_eq!(err.failures.len(), 1);
    assert_eq!(err.failures[0].endpoint(), "broken");
    assert!(matches!(err.failures[0], EndpointError::ShutdownLoss { .. }));
    assert!(err.lost_entries() > 0);

    let failing = metrics.endpoint("broken");
    assert!(failing.dropped(drop_reason::BACKLOG_FULL) > 0);
    let snapshot = failing.snapshot();
    assert_eq!(snapshot.entries_received, ENTRIES as u64);
    assert_eq!(snapshot.dropped_entries, ENTRIES as u64);
    assert_eq!(snapshot.batches_sent, 0);

    let healthy_metrics = metrics.endpoint("healthy").snapshot();
    assert_eq!(healthy_metrics.sent_entries, ENTRIES as u64);
    assert_eq!(healthy_metrics.dropped_entries, 0);
}

#[tokio::test]
async fn shutdown_flushes_buffered_entries() {
    let server = loki(200).await;
    let mut config = endpoint(&server, "primary");
    config.batch_wait = Duration::from_secs(60);

    let engine = Engine::start(EngineConfig::new(vec![config])).unwrap();
    let ingress = engine.ingress();
    for i in 0..5 {
        ingress
            .send(Entry::now(labels(&[("app", "x")]), format!("entry {i}")))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.received_requests().await.unwrap().is_empty());

    engine.shutdown().await.unwrap();
    let all = lines(&pushed(&server.received_requests().await.unwrap()));
    assert_eq!(all.len(), 5);
}

#[tokio::test]
async fn size_trigger_flushes_before_batch_wait() {
    let server = loki(200).await;
    let mut config = endpoint(&server, "primary");
    config.batch_wait = Duration::from_secs(60);
    config.batch_size = 16;

    let engine = Engine::start(EngineConfig::new(vec![config])).unwrap();
    engine
        .ingress()
        .send(Entry::now(
            labels(&[("app", "x")]),
            "a line longer than sixteen bytes",
        ))
        .await
        .unwrap();

    let requests = wait_for_requests(&server, 1).await;
    assert_eq!(requests.len(), 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn reserved_label_overrides_tenant() {
    let server = loki(200).await;
    let mut config = endpoint(&server, "primary");
    config.tenant_id = Some("default".to_string());

    let engine = Engine::start(EngineConfig::new(vec![config])).unwrap();
    engine
        .ingress()
        .send(Entry::now(
            labels(&[("app", "x"), (TENANT_LABEL, "team-b")]),
            "routed",
        ))
        .await
        .unwrap();
    engine.shutdown().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].headers.get("x-scope-orgid").unwrap(), "team-b");
    let push = pushed(&requests);
    assert_eq!(push[0].streams[0].labels, r#"{app="x"}"#);
}

#[tokio::test]
async fn ingress_is_closed_after_shutdown() {
    let server = loki(200).await;
    let engine = Engine::start(EngineConfig::new(vec![endpoint(&server, "primary")])).unwrap();
    let ingress = engine.ingress();
    engine.shutdown().await.unwrap();

    assert!(ingress.is_closed());
    let err = ingress
        .send(Entry::now(labels(&[("app", "x")]), "late"))
        .await
        .unwrap_err();
    assert_eq!(err, QueueError::Closed);
}

#[tokio::test]
async fn dropped_entries_are_counted_under_ingress() {
    let server = loki(200).await;
    let mut engine_config = EngineConfig::new(vec![endpoint(&server, "primary")]);
    engine_config.ingress.capacity = 1;
    engine_config.ingress.policy = BackpressurePolicy::DropNewest;

    let engine = Engine::start(engine_config).unwrap();
    let ingress = engine.ingress();
    let mut dropped = 0;
    for i in 0..200 {
        let outcome = ingress
            .try_send(Entry::now(labels(&[("app", "x")]), format!("{i}")))
            .unwrap();
        if outcome.dropped() {
            dropped += 1;
        }
    }
    assert!(dropped > 0);

    let text = engine.metrics().export_text().unwrap();
    assert!(text.contains(&format!(
        r#"loki_write_dropped_entries_total{{endpoint="ingress",reason="queue_full"}} {dropped}"#
    )));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn metrics_track_endpoint_deliveries() {
    let server = loki(200).await;
    let engine = Engine::start(EngineConfig::new(vec![endpoint(&server, "primary")])).unwrap();
    engine
        .ingress()
        .send(Entry::now(labels(&[("app", "x")]), "counted"))
        .await
        .unwrap();
    wait_for_requests(&server, 1).await;

    let metrics = engine.metrics().clone();
    engine.shutdown().await.unwrap();

    let snapshot = metrics.endpoint("primary").snapshot();
    assert_eq!(snapshot.entries_received, 1);
    assert_eq!(snapshot.batches_sent, 1);
    assert_eq!(snapshot.sent_entries, 1);
    assert_eq!(snapshot.sent_bytes, "counted".len() as u64);
}

#[tokio::test]
async fn invalid_configuration_starts_nothing() {
    let err = Engine::start(EngineConfig::default()).err().unwrap();
    assert!(matches!(err, WriteError::Config(_)));

    let mut bad = EndpointConfig::new("http://localhost:3100/loki/api/v1/push");
    bad.max_in_flight = 0;
    let err = Engine::start(EngineConfig::new(vec![bad])).err().unwrap();
    assert!(matches!(err, WriteError::Config(_)));
}
