use loki_write::buffer::{AppendError, BatchConfig, BatchManager, FlushReason};
use loki_write::domain::{Entry, LabelSet, TENANT_LABEL};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn entry(labels: &[(&str, &str)], line: &str) -> Arc<Entry> {
    Arc::new(Entry::now(labels.iter().copied().collect(), line))
}

fn manager(config: BatchConfig) -> BatchManager {
    BatchManager::new(config)
}

#[tokio::test]
async fn groups_entries_by_label_set_regardless_of_order() {
    let mut manager = manager(BatchConfig::default());
    manager
        .append(entry(&[("app", "api"), ("env", "prod")], "one"))
        .unwrap();
    manager
        .append(entry(&[("env", "prod"), ("app", "api")], "two"))
        .unwrap();
    manager.append(entry(&[("app", "web")], "three")).unwrap();

    assert_eq!(manager.stream_count(), 2);
    assert_eq!(manager.buffered_entries(), 3);

    let batches = manager.flush(FlushReason::Time);
    assert_eq!(batches.len(), 1);
    let streams = batches[0].streams();
    assert_eq!(streams[0].labels.canonical(), r#"{app="api", env="prod"}"#);
    let lines: Vec<_> = streams[0].entries.iter().map(|e| e.line()).collect();
    assert_eq!(lines, vec!["one", "two"]);
    assert_eq!(streams[1].labels.canonical(), r#"{app="web"}"#);
}

#[tokio::test]
async fn entry_labels_win_over_external_labels() {
    let mut manager = manager(BatchConfig {
        external_labels: LabelSet::from([("cluster", "eu"), ("app", "default")]),
        ..BatchConfig::default()
    });
    manager.append(entry(&[("app", "api")], "line")).unwrap();

    let batches = manager.flush(FlushReason::Time);
    let labels = &batches[0].streams()[0].labels;
    assert_eq!(labels.get("app"), Some("api"));
    assert_eq!(labels.get("cluster"), Some("eu"));
}

#[tokio::test]
async fn reserved_label_routes_to_tenant() {
    let mut manager = manager(BatchConfig {
        tenant_id: Some("default".to_string()),
        ..BatchConfig::default()
    });
    manager.append(entry(&[("app", "a")], "to default")).unwrap();
    manager
        .append(entry(&[("app", "a"), (TENANT_LABEL, "other")], "to other"))
        .unwrap();

    let batches = manager.flush(FlushReason::Time);
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].tenant_id(), Some("default"));
    assert_eq!(batches[1].tenant_id(), Some("other"));
    assert!(!batches[1].streams()[0].labels.contains(TENANT_LABEL));
    assert_eq!(batches[1].streams()[0].entries[0].line(), "to other");
}

#[tokio::test]
async fn rejects_empty_label_set() {
    let mut manager = manager(BatchConfig::default());
    let err = manager.append(entry(&[], "orphan")).unwrap_err();
    assert_eq!(err, AppendError::EmptyLabelSet);
    assert_eq!(err.reason(), "empty_labels");
    assert!(manager.is_empty());
}

#[tokio::test]
async fn enforces_stream_limit_per_tenant() {
    let mut manager = manager(BatchConfig {
        max_streams: 1,
        ..BatchConfig::default()
    });
    manager.append(entry(&[("app", "a")], "1")).unwrap();
    manager.append(entry(&[("app", "a")], "2")).unwrap();

    let err = manager.append(entry(&[("app", "b")], "3")).unwrap_err();
    assert_eq!(err.reason(), "stream_limited");

    manager
        .append(entry(&[("app", "b"), (TENANT_LABEL, "t2")], "4"))
        .unwrap();
    assert_eq!(manager.stream_count(), 2);
}

#[tokio::test]
async fn size_trigger_fires_at_threshold() {
    let mut manager = manager(BatchConfig {
        batch_size: 10,
        ..BatchConfig::default()
    });
    manager.append(entry(&[("app", "a")], "12345")).unwrap();
    assert!(!manager.size_triggered());
    manager.append(entry(&[("app", "a")], "67890")).unwrap();
    assert!(manager.size_triggered());

    let batches = manager.flush(FlushReason::Size);
    assert_eq!(batches[0].reason(), FlushReason::Size);
    assert_eq!(batches[0].bytes(), 10);
    assert_eq!(manager.buffered_bytes(), 0);
    assert!(!manager.size_triggered());
}

#[tokio::test]
async fn deadline_tracks_oldest_stream() {
    let wait = Duration::from_millis(500);
    let mut manager = manager(BatchConfig {
        batch_wait: wait,
        ..BatchConfig::default()
    });
    assert!(manager.deadline().is_none());

    let before = Instant::now();
    manager.append(entry(&[("app", "a")], "x")).unwrap();
    let deadline = manager.deadline().unwrap();

    assert!(deadline >= before + wait);
    assert!(manager.time_triggered(deadline));
    assert!(!manager.time_triggered(deadline - Duration::from_millis(1)));

    manager.flush(FlushReason::Time);
    assert!(manager.deadline().is_none());
}

#[tokio::test]
async fn flush_of_empty_manager_yields_nothing() {
    let mut manager = manager(BatchConfig::default());
    assert!(manager.flush(FlushReason::Shutdown).is_empty());
}
