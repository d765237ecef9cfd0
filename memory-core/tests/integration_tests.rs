//! Integration tests for memory-core
//!
//! These tests verify that classification, redaction, the ephemeral store,
//! durable assembly and trimming work together correctly.

mod test_utils;

use async_trait::async_trait;
use memory_core::*;
use mockall::mock;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_utils::*;
use tokio_util::sync::CancellationToken;

mock! {
    pub Store {}

    #[async_trait]
    impl MemoryStore for Store {
        async fn upsert(&self, record: &MemoryRecord) -> memory_core::Result<()>;
        async fn get(&self, session_id: &str) -> memory_core::Result<Option<MemoryRecord>>;
        async fn delete(&self, session_id: &str) -> memory_core::Result<bool>;
        async fn list_sessions(&self) -> memory_core::Result<Vec<String>>;
    }
}

/// Six 100-token turns, K=5, budget 450: the latest four turns remain
#[test]
fn test_trim_scenario_keeps_latest_four_turns() {
    let history = uniform_history("s1", 6, 100);
    let context = trim(&history, 450, 5);

    assert_eq!(context.turns_kept, 4);
    assert_eq!(context.total_tokens, 400);
    let ids: Vec<&str> = context.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["u2", "m2", "u3", "m3", "u4", "m4", "u5", "m5"]);
}

/// The most recent turn survives every budget, and the window never exceeds
/// the budget unless it is that single turn
#[test]
fn test_trim_never_drops_latest_turn() {
    let history = uniform_history("s1", 7, 90);
    for budget in [0u64, 1, 89, 90, 91, 179, 180, 500, 10_000] {
        for k in 0..9 {
            let context = trim(&history, budget, k);
            assert!(context.turns_kept >= 1);
            assert_eq!(context.events.last().map(|e| e.id.as_str()), Some("m6"));
            assert!(context.turns_kept <= k.max(1));
            if context.turns_kept > 1 {
                assert!(context.total_tokens <= budget);
            }
            assert_eq!(context.over_budget, context.total_tokens > budget);
        }
    }
}

/// Voice events are persistable only with a summary
#[test]
fn test_voice_summary_classification() {
    let parsed = parse_events("s1", &[raw_voice(Some("asked about milk prices"), 0), raw_voice(None, 1)]);
    assert_eq!(parsed.dropped, 0);
    assert!(classify(&parsed.events[0]));
    assert!(!classify(&parsed.events[1]));
}

/// The canonical redaction example
#[test]
fn test_redaction_scenario() {
    assert_eq!(
        redact("contact me at a@b.com or 0901234567"),
        "contact me at [REDACTED] or [REDACTED]"
    );
}

/// Redacting already-redacted text changes nothing
#[test]
fn test_redaction_is_idempotent_over_corpus() {
    let redactor = Redactor::default()
        .with_rule(Arc::new(LiteralRule::new("openai", "sk-").unwrap()))
        .unwrap();
    let corpus = [
        "call +84 90 123 4567 or mail an.nguyen@shop.vn",
        "token sk-live-abc123 then 0901234567",
        "no secrets here, just 2 hộp sữa",
        "[REDACTED] [REDACTED]",
        "edge: a@b.c 1234567 12345678",
        "",
    ];
    for text in corpus {
        let once = redactor.redact_text(text);
        assert_eq!(redactor.redact_text(&once), once, "not idempotent for {:?}", text);
    }
}

/// A full session routed through the manager leaves no tool payload in the
/// stored record
#[tokio::test]
async fn test_no_tool_data_in_durable_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = MemoryConfig {
        storage: StorageConfig {
            root_dir: Some(dir.path().to_path_buf()),
            ..StorageConfig::default()
        },
        ..MemoryConfig::default()
    };
    let manager = MemoryManager::open(&config).unwrap();
    let session_id = unique_session_id("shopper");
    let mut session = manager.open_session(session_id.clone());

    let raw = vec![
        raw_user_text("tìm sữa tươi, gọi 0901234567", 0),
        json!({"kind": "ToolRequest", "tool": "product_search", "args": {"q": "sữa tươi"}, "timestamp": at(1).to_rfc3339()}),
        raw_tool_result("product_search", json!({"items": [{"sku": "SKU-991", "price": 35000}]}), 2),
        raw_model_text("Có 1 sản phẩm phù hợp", 3),
        raw_voice(Some("wants two cartons"), 4),
        raw_model_text("Đã thêm 2 hộp", 5),
    ];
    assert_eq!(session.ingest(&raw), 0);
    assert_eq!(session.tool_output("product_search"), Some(json!({"items": [{"sku": "SKU-991", "price": 35000}]})));

    session.close().await.unwrap();

    let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(files.len(), 1);
    let stored = std::fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
    assert!(!stored.contains("SKU-991"));
    assert!(!stored.contains("product_search"));
    assert!(!stored.contains("0901234567"));

    let record = manager.assembler().load(&session_id).await.unwrap().unwrap();
    assert_eq!(record.user_messages, vec!["tìm sữa tươi, gọi [REDACTED]".to_string()]);
    assert_eq!(record.user_media_summaries[0].summary, "wants two cartons");
    assert_eq!(record.user_media_summaries[0].meta.duration_ms, Some(4100));
    assert_eq!(record.model_responses.len(), 2);
    assert_eq!(record.meta.started_at, Some(at(0)));
    assert_eq!(record.meta.ended_at, Some(at(5)));
    assert_eq!(session.tool_output("product_search"), None);
}

/// Expired entries read as absent before any sweep has run
#[test]
fn test_ephemeral_expiry_without_sweep() {
    let (store, clock) = manual_store(&EphemeralConfig::default());
    let ns = session_namespace("s1", "tool");
    store.set(&ns, "search", json!({"page": 1}), Duration::from_secs(900));

    clock.advance(Duration::from_secs(899));
    assert!(store.get(&ns, "search").is_some());
    clock.advance(Duration::from_secs(1));
    assert!(store.get(&ns, "search").is_none());
}

/// The manager's sweeper task clears expired entries and stops on cancel
#[tokio::test]
async fn test_manager_sweeper_lifecycle() {
    let config = MemoryConfig {
        ephemeral: EphemeralConfig {
            sweep_interval_ms: 5,
            ..EphemeralConfig::default()
        },
        ..MemoryConfig::default()
    };
    let manager = MemoryManager::open(&config).unwrap();
    manager
        .ephemeral()
        .set("session/a/tool", "k", json!(1), Duration::from_millis(1));

    let cancellation = CancellationToken::new();
    let handle = manager.spawn_sweeper(cancellation.clone());
    for _ in 0..200 {
        if manager.ephemeral().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(manager.ephemeral().is_empty());

    cancellation.cancel();
    handle.await.unwrap();
}

/// Storage failures surface as retryable errors and are not retried
#[tokio::test]
async fn test_checkpoint_storage_failure_is_retryable() {
    let mut store = MockStore::new();
    store
        .expect_upsert()
        .withf(|record: &MemoryRecord| record.session_id == "s1")
        .times(1)
        .returning(|_| {
            Err(StoreError::Unavailable {
                reason: "connection reset".to_string(),
            }
            .into())
        });

    let assembler = Assembler::new(Arc::new(store), Redactor::default(), Duration::from_secs(1));
    let events = uniform_history("s1", 1, 10);
    let err = assembler
        .checkpoint("s1", &events, &SessionAttributes::default())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

/// A failed close keeps the session's volatile state for a retry
#[tokio::test]
async fn test_failed_close_keeps_tool_state() {
    let mut store = MockStore::new();
    store.expect_upsert().times(1).returning(|record| {
        Err(StoreError::WriteFailed {
            session_id: record.session_id.clone(),
            reason: "disk full".to_string(),
        }
        .into())
    });

    let config = MemoryConfig::default();
    let manager = MemoryManager::from_config(&config, Arc::new(store)).unwrap();
    let mut session = manager.open_session("s1");
    session.record(ConversationEvent::user_text("s1", "hello"));
    session.record(ConversationEvent::tool_result("s1", "search", json!([1])));

    assert!(session.close().await.is_err());
    assert_eq!(session.tool_output("search"), Some(json!([1])));
}

/// Concurrent sessions sharing one manager never see each other's tool state
#[tokio::test]
async fn test_concurrent_sessions_are_isolated() {
    let manager = MemoryManager::open(&MemoryConfig::default()).unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let session_id = format!("session-{}", i);
            let mut session = manager.open_session(session_id.clone());
            for turn in conversation_turn(&session_id, i, 10, 10) {
                session.record(turn);
            }
            session.record(ConversationEvent::tool_result(&session_id, "cart", json!({"owner": i})));
            assert_eq!(session.tool_output("cart"), Some(json!({"owner": i})));
            session.checkpoint().await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let sessions = manager.assembler().sessions().await.unwrap();
    assert_eq!(sessions.len(), 8);
    for i in 0..8 {
        let owner = manager.ephemeral().get(&session_namespace(&format!("session-{}", i), "tool"), "cart");
        assert_eq!(owner, Some(json!({"owner": i})));
    }
}

/// Configuration text drives every component
#[cfg(feature = "config-support")]
#[tokio::test]
async fn test_config_driven_manager() {
    let config = MemoryConfig::from_toml_str(
        r#"
        [context]
        token_budget = 450
        max_turns = 5

        [redaction]
        placeholder = "<hidden>"

        [[redaction.patterns]]
        name = "order_id"
        pattern = "ORD-[0-9]{6}"
        "#,
    )
    .unwrap();
    let manager = MemoryManager::open(&config).unwrap();
    let mut session = manager.open_session("s1");

    for event in uniform_history("s1", 6, 100) {
        session.record(event);
    }
    assert_eq!(session.context().turns_kept, 4);

    session.record(ConversationEvent::user_text("s1", "status of ORD-123456 for a@b.com?"));
    let record = session.assemble().record;
    assert_eq!(record.user_messages.last().unwrap(), "status of <hidden> for <hidden>?");
}
