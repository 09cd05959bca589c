//! Centralized log/metric store invariants against a real on-disk SQLite
//! file (rather than the unit tests' in-memory database): monotonic ids,
//! batch atomicity, pagination limits, and retention sweeps wired through
//! the orchestrator.
#[path = "common/mod.rs"]
mod common;

use chrono::Utc;
use common::{env_lock, Fixture};
use helmd::logstore::{LogEntryInput, LogLevel, LogQuery, LogStore};
use helmd::registry::Registry;
use helmd::runtime;

fn entry(service: &str, message: &str, level: LogLevel) -> LogEntryInput {
    LogEntryInput {
        timestamp: Utc::now(),
        service_name: service.to_string(),
        level,
        message: message.to_string(),
        context: serde_json::json!({}),
        trace_id: None,
        user_id: None,
        hostname: "host-a".to_string(),
        process_id: Some(1),
    }
}

#[test]
fn ids_are_monotonic_across_separate_ingest_calls_on_a_real_file() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    runtime::init(fixture.root());
    runtime::ensure_directories().unwrap();

    let store = LogStore::open(&runtime::logstore_db_path()).unwrap();
    store.ingest(&[entry("core", "first", LogLevel::Info)]).unwrap();
    store.ingest(&[entry("core", "second", LogLevel::Info)]).unwrap();
    store.ingest(&[entry("core", "third", LogLevel::Info)]).unwrap();

    let results = store.query(&LogQuery::new()).unwrap();
    assert_eq!(results.len(), 3);
    // Newest first; ids still increase monotonically with insertion order.
    assert!(results[0].id > results[1].id);
    assert!(results[1].id > results[2].id);
}

#[test]
fn log_entries_survive_a_store_reopen() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    runtime::init(fixture.root());
    runtime::ensure_directories().unwrap();

    {
        let store = LogStore::open(&runtime::logstore_db_path()).unwrap();
        store.ingest(&[entry("core", "persisted", LogLevel::Info)]).unwrap();
    }

    let reopened = LogStore::open(&runtime::logstore_db_path()).unwrap();
    let results = reopened.query(&LogQuery::new()).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].message, "persisted");
}

#[test]
fn malformed_entry_in_a_batch_leaves_no_partial_write_on_disk() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    runtime::init(fixture.root());
    runtime::ensure_directories().unwrap();

    let store = LogStore::open(&runtime::logstore_db_path()).unwrap();
    let mut bad_entry = entry("core", "", LogLevel::Info);
    bad_entry.message = String::new();
    let batch = vec![entry("core", "good", LogLevel::Info), bad_entry];

    let err = store.ingest(&batch).unwrap_err();
    assert!(matches!(err, helmd::error::LogStoreError::MalformedEntry { .. }));

    let results = store.query(&LogQuery::new()).unwrap();
    assert!(results.is_empty());
}

#[test]
fn pagination_respects_limit_and_offset() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    runtime::init(fixture.root());
    runtime::ensure_directories().unwrap();

    let store = LogStore::open(&runtime::logstore_db_path()).unwrap();
    for i in 0..5 {
        store.ingest(&[entry("core", &format!("line-{i}"), LogLevel::Info)]).unwrap();
    }

    let mut query = LogQuery::new();
    query.limit = 2;
    query.offset = 0;
    let first_page = store.query(&query).unwrap();
    assert_eq!(first_page.len(), 2);

    query.offset = 2;
    let second_page = store.query(&query).unwrap();
    assert_eq!(second_page.len(), 2);
    assert_ne!(first_page[0].id, second_page[0].id);
}

#[test]
fn orchestrator_enforce_log_retention_sweeps_a_real_store() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    runtime::init(fixture.root());
    std::fs::write(
        fixture.root().join("services.json"),
        r#"{"core_required": [], "default_optional": [], "system_dependencies": []}"#,
    )
    .unwrap();
    let _registry_guard = Registry::build().unwrap();

    let orchestrator = helmd::orchestrator::Orchestrator::bootstrap().unwrap();
    let mut old_entry = entry("core", "ancient", LogLevel::Info);
    old_entry.timestamp = Utc::now() - chrono::Duration::days(200);
    orchestrator.log_store.ingest(&[old_entry]).unwrap();
    orchestrator.log_store.ingest(&[entry("core", "fresh", LogLevel::Info)]).unwrap();

    let removed = orchestrator.enforce_log_retention().unwrap();
    assert_eq!(removed, 1);

    let remaining = orchestrator.log_store.query(&LogQuery::new()).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].message, "fresh");
}
