//! Pipeline integration tests against the SQLite entity store.
//!
//! This test suite covers:
//! - Batch processing, evaluation and scoring on SQLite
//! - Parity with the in-memory store for the same batches
//! - State surviving a reopen of a file database
//!
//! Note: SQLite tests use in-memory or temporary file databases.

#![cfg(feature = "sqlite")]

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use goldrec_core::{
    ChangeEvent, ChangeOperation, EntityStore, EntityType, GoldrecConfig, MemoryStore, Pipeline,
    Result, SqliteStore, ViolationStatus,
};
use serde_json::{Value, json};
use std::sync::Arc;

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
}

fn event(batch_id: &str, sequence: u64, source: &str, key: &str, after: Value) -> ChangeEvent {
    ChangeEvent {
        batch_id: batch_id.to_string(),
        sequence,
        source: source.to_string(),
        entity_type: EntityType::Provider,
        entity_key: key.to_string(),
        operation: ChangeOperation::Insert,
        before: None,
        after: Some(after),
        captured_at: at(2024, 5, sequence as u32),
    }
}

fn first_batch() -> Vec<ChangeEvent> {
    vec![
        event("b1", 1, "claims", "C-1", json!({
            "npi": "1234567893", "first_name": "Ann", "last_name": "Lee",
            "email": "ann.lee@stlukes.org", "phone": "(555) 201-3344",
            "affiliations": [{"facility_ref": "F100", "is_primary": true}]
        })),
        event("b1", 2, "registry", "R-1", json!({
            "npi": "1234567893", "first_name": "Ann", "last_name": "Lee",
            "specialty": "Cardiology"
        })),
        event("b1", 3, "registry", "R-2", json!({
            "npi": "12345", "first_name": "Bo", "last_name": "Chan"
        })),
        event("b1", 4, "registry", "R-3", json!("not an object")),
    ]
}

fn pipeline(store: Arc<dyn EntityStore>) -> Pipeline {
    Pipeline::new(store, GoldrecConfig::default())
        .unwrap()
        .with_as_of(NaiveDate::from_ymd_opt(2024, 7, 1).unwrap())
}

#[tokio::test]
async fn test_sqlite_pipeline_round() -> Result<()> {
    let store = Arc::new(SqliteStore::in_memory().await?);
    let pipeline = pipeline(store.clone());

    let result = pipeline.process_batch("b1", &first_batch()).await?;
    assert_eq!(result.processed, 3);
    assert_eq!(result.quarantined, 1);
    assert_eq!(store.dead_letters().await?.len(), 1);
    assert!(store.is_batch_completed("b1").await?);

    let golden = store.active_golden("prov:npi:1234567893").await?.expect("golden");
    assert_eq!(golden.version, 1);
    assert_eq!(golden.source_records.len(), 2);

    let again = pipeline.process_batch("b1", &first_batch()).await?;
    assert!(again.already_completed);

    let report = pipeline.evaluate().await?;
    assert!(report.open_violations > 0);
    let npi = store
        .violations()
        .await?
        .into_iter()
        .find(|v| v.rule_name == "npi_format" && v.entity_id == "prov:rec:registry:R-2")
        .expect("npi violation");
    assert_eq!(npi.status, ViolationStatus::Open);

    let scores = pipeline.score("b1").await?;
    assert_eq!(scores[0].metric.record_count, 3);
    assert!(scores[0].stored);
    assert!(!pipeline.score("b1").await?[0].stored);
    Ok(())
}

#[tokio::test]
async fn test_sqlite_matches_memory_store() -> Result<()> {
    let sqlite: Arc<dyn EntityStore> = Arc::new(SqliteStore::in_memory().await?);
    let memory: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());

    let update = vec![event("b2", 1, "registry", "R-1", json!({
        "npi": "1234567893", "first_name": "Ann", "last_name": "Lee",
        "specialty": "Cardiac Surgery"
    }))];

    for store in [&sqlite, &memory] {
        let pipeline = pipeline(Arc::clone(store));
        pipeline.process_batch("b1", &first_batch()).await?;
        pipeline.process_batch("b2", &update).await?;
        pipeline.evaluate().await?;
    }

    let mut sqlite_golden = sqlite.active_golden_records().await?;
    let mut memory_golden = memory.active_golden_records().await?;
    sqlite_golden.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
    memory_golden.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));

    let ids = |records: &[goldrec_core::GoldenRecord]| {
        records
            .iter()
            .map(|g| (g.cluster_id.clone(), g.version))
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(&sqlite_golden), ids(&memory_golden));
    for (s, m) in sqlite_golden.iter().zip(&memory_golden) {
        assert!(s.same_content(m), "content differs for {}", s.cluster_id);
    }

    let rules = |violations: Vec<goldrec_core::Violation>| {
        let mut keys: Vec<_> = violations
            .into_iter()
            .map(|v| (v.rule_name, v.entity_id, v.status))
            .collect();
        keys.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        keys
    };
    assert_eq!(rules(sqlite.violations().await?), rules(memory.violations().await?));
    Ok(())
}

#[tokio::test]
async fn test_sqlite_file_store_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("goldrec.db");
    let url = format!("sqlite://{}", path.display());

    {
        let store = Arc::new(SqliteStore::open(&url).await?);
        pipeline(store.clone()).process_batch("b1", &first_batch()).await?;
        store.close().await;
    }

    let store = Arc::new(SqliteStore::open(&url).await?);
    assert!(store.is_batch_completed("b1").await?);
    assert!(store.active_golden("prov:npi:1234567893").await?.is_some());
    let again = pipeline(store.clone()).process_batch("b1", &first_batch()).await?;
    assert!(again.already_completed);
    Ok(())
}
