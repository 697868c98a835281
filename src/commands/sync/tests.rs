use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use super::run::{build_manifest, resolve_strategy};
use super::*;
use crate::config::SyncConfig;
use crate::embedding::{EMBEDDING_DIM, EmbeddingService, EmbeddingStrategy, decode_vector};
use crate::error::{EmbeddingError, GatewayError};
use crate::gateway::{CatalogGateway, SqliteGateway};
use crate::model::{CatalogRecord, RecordId, SyncLogEntry, SyncRunRecord};
use crate::util::{record_ids_digest, utc_string};

#[derive(Default)]
struct FakeGateway {
    records: Vec<CatalogRecord>,
    last_sync: Option<DateTime<Utc>>,
    fail_listing: bool,
    fail_log_read: bool,
    reject: HashSet<String>,
    writes: RefCell<Vec<(RecordId, String)>>,
    runs: RefCell<Vec<SyncRunRecord>>,
}

impl FakeGateway {
    fn with_records(records: Vec<CatalogRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    fn written_ids(&self) -> Vec<String> {
        self.writes
            .borrow()
            .iter()
            .map(|(id, _)| id.to_string())
            .collect()
    }
}

impl CatalogGateway for FakeGateway {
    async fn list_all_catalog_records(&self) -> Result<Vec<CatalogRecord>, GatewayError> {
        if self.fail_listing {
            return Err(GatewayError::Malformed("catalog offline".to_string()));
        }
        Ok(self.records.clone())
    }

    async fn get_last_sync_entry(&self) -> Result<Option<SyncLogEntry>, GatewayError> {
        if self.fail_log_read {
            return Err(GatewayError::Malformed("update_logs missing".to_string()));
        }
        Ok(self.last_sync.map(|created_at| SyncLogEntry { created_at }))
    }

    async fn update_embedding(
        &self,
        record_id: &RecordId,
        encoded_vector: &str,
    ) -> Result<bool, GatewayError> {
        if self.reject.contains(record_id.as_str()) {
            return Ok(false);
        }
        self.writes
            .borrow_mut()
            .push((record_id.clone(), encoded_vector.to_string()));
        Ok(true)
    }

    async fn record_sync_run(&self, run: &SyncRunRecord) -> Result<(), GatewayError> {
        self.runs.borrow_mut().push(run.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

#[derive(Default)]
struct FakeService {
    prompts: RefCell<Vec<String>>,
    fail_on: Option<&'static str>,
    slow_on: Option<&'static str>,
    cancel_on_call: Option<(usize, CancellationToken)>,
    calls: Cell<usize>,
}

impl EmbeddingService for FakeService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.prompts.borrow_mut().push(text.to_string());
        self.calls.set(self.calls.get() + 1);

        if let Some((call, token)) = &self.cancel_on_call {
            if self.calls.get() == *call {
                token.cancel();
            }
        }
        if self.fail_on.is_some_and(|needle| text.contains(needle)) {
            return Err(EmbeddingError::Status {
                status: reqwest::StatusCode::TOO_MANY_REQUESTS,
                body: "rate limited".to_string(),
            });
        }
        if self.slow_on.is_some_and(|needle| text.contains(needle)) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(vec![0.5; EMBEDDING_DIM])
    }

    fn model_name(&self) -> &str {
        "fake-embedder"
    }
}

fn record(id: &str, tags: &[&str]) -> CatalogRecord {
    CatalogRecord {
        id: RecordId::new(id),
        name: format!("Coffee {id}"),
        flavor_tags: tags.iter().map(|tag| tag.to_string()).collect(),
        created_at: None,
        updated_at: None,
        flavor_embedding: None,
    }
}

fn numbered_records(count: usize) -> Vec<CatalogRecord> {
    (1..=count)
        .map(|n| record(&format!("c{n:02}"), &["chocolate", "citrus"]))
        .collect()
}

fn unpaced_config() -> SyncConfig {
    SyncConfig {
        inter_record_delay: Duration::ZERO,
        inter_batch_delay: Duration::ZERO,
        ..SyncConfig::default()
    }
}

fn ts(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .expect("valid ts")
}

#[tokio::test(flavor = "current_thread")]
async fn batches_visit_every_record_once_in_order() {
    let records = numbered_records(13);
    let gateway = FakeGateway::with_records(Vec::new());
    let config = unpaced_config();

    let runner = SyncRunner::new(
        &gateway,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        CancellationToken::new(),
    );
    let report = runner.run(&records).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.updated, 13);
    assert_eq!(report.failed, 0);
    let sizes: Vec<usize> = report.batches.iter().map(|batch| batch.batch_size).collect();
    assert_eq!(sizes, vec![5, 5, 3]);
    assert_eq!(report.batches[2].processed, 13);
    assert_eq!(report.batches[2].percent_complete, 100.0);

    let expected: Vec<String> = records.iter().map(|record| record.id.to_string()).collect();
    assert_eq!(gateway.written_ids(), expected);
    for (_, literal) in gateway.writes.borrow().iter() {
        assert_eq!(decode_vector(literal).expect("decodes").len(), EMBEDDING_DIM);
    }
}

#[tokio::test(flavor = "current_thread")]
async fn dry_run_generates_but_never_writes() {
    let records = numbered_records(4);
    let gateway = FakeGateway::default();
    let service = FakeService::default();
    let config = SyncConfig {
        dry_run: true,
        ..unpaced_config()
    };

    let runner = SyncRunner::new(
        &gateway,
        EmbeddingStrategy::Primary(&service),
        &config,
        CancellationToken::new(),
    );
    let report = runner.run(&records).await;

    assert_eq!(report.updated, 4);
    assert_eq!(service.calls.get(), 4);
    assert!(gateway.writes.borrow().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn tagless_record_never_reaches_the_generator() {
    let records = vec![record("a", &["floral"]), record("b", &[]), record("c", &["nutty"])];
    let gateway = FakeGateway::default();
    let service = FakeService::default();
    let config = unpaced_config();

    let runner = SyncRunner::new(
        &gateway,
        EmbeddingStrategy::Primary(&service),
        &config,
        CancellationToken::new(),
    );
    let report = runner.run(&records).await;

    assert_eq!(report.updated, 2);
    assert_eq!(report.failed_records, vec![RecordId::new("b")]);
    assert_eq!(service.prompts.borrow().as_slice(), ["floral", "nutty"]);
}

#[tokio::test(flavor = "current_thread")]
async fn primary_failure_fails_the_record_without_fallback() {
    let records = vec![
        record("a", &["berry"]),
        record("b", &["smoky", "earthy"]),
        record("c", &["honey"]),
    ];
    let gateway = FakeGateway::default();
    let service = FakeService {
        fail_on: Some("smoky"),
        ..FakeService::default()
    };
    let config = unpaced_config();

    let runner = SyncRunner::new(
        &gateway,
        EmbeddingStrategy::Primary(&service),
        &config,
        CancellationToken::new(),
    );
    let report = runner.run(&records).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.updated, 2);
    assert_eq!(report.failed_records, vec![RecordId::new("b")]);
    assert_eq!(gateway.written_ids(), vec!["a", "c"]);
}

#[tokio::test(flavor = "current_thread")]
async fn rejected_update_counts_as_failure() {
    let records = vec![record("a", &["berry"]), record("b", &["cocoa"])];
    let gateway = FakeGateway {
        reject: HashSet::from(["b".to_string()]),
        ..FakeGateway::default()
    };
    let config = unpaced_config();

    let runner = SyncRunner::new(
        &gateway,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        CancellationToken::new(),
    );
    let report = runner.run(&records).await;

    assert_eq!(report.updated, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_records, vec![RecordId::new("b")]);
}

#[tokio::test(flavor = "current_thread")]
async fn cancellation_stops_the_run_with_partial_counts() {
    let records = numbered_records(8);
    let gateway = FakeGateway::default();
    let cancel = CancellationToken::new();
    let service = FakeService {
        cancel_on_call: Some((3, cancel.clone())),
        ..FakeService::default()
    };
    let config = unpaced_config();

    let runner = SyncRunner::new(
        &gateway,
        EmbeddingStrategy::Primary(&service),
        &config,
        cancel,
    );
    let report = runner.run(&records).await;

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.updated, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(gateway.written_ids(), vec!["c01", "c02"]);
    assert_eq!(service.calls.get(), 3);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cancellation_interrupts_pacing_sleep() {
    let records = numbered_records(3);
    let gateway = FakeGateway::default();
    let cancel = CancellationToken::new();
    let config = SyncConfig {
        inter_record_delay: Duration::from_secs(30),
        ..unpaced_config()
    };

    let runner = SyncRunner::new(
        &gateway,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        cancel.clone(),
    );
    let started = tokio::time::Instant::now();
    let (report, ()) = tokio::join!(runner.run(&records), async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
    });

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert_eq!(report.updated, 1);
    assert_eq!(gateway.written_ids(), vec!["c01"]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn slow_embedding_call_times_out_one_record() {
    let records = vec![
        record("a", &["citrus"]),
        record("b", &["slow roast"]),
        record("c", &["malt"]),
    ];
    let gateway = FakeGateway::default();
    let service = FakeService {
        slow_on: Some("slow"),
        ..FakeService::default()
    };
    let config = SyncConfig {
        call_timeout: Some(Duration::from_secs(5)),
        ..unpaced_config()
    };

    let runner = SyncRunner::new(
        &gateway,
        EmbeddingStrategy::Primary(&service),
        &config,
        CancellationToken::new(),
    );
    let report = runner.run(&records).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.updated, 2);
    assert_eq!(report.failed_records, vec![RecordId::new("b")]);
    assert_eq!(gateway.written_ids(), vec!["a", "c"]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn pacing_sleeps_between_records_and_batches_only() {
    let records = numbered_records(7);
    let gateway = FakeGateway::default();
    let config = SyncConfig {
        inter_record_delay: Duration::from_secs(1),
        inter_batch_delay: Duration::from_secs(3),
        ..SyncConfig::default()
    };

    let runner = SyncRunner::new(
        &gateway,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        CancellationToken::new(),
    );
    let started = tokio::time::Instant::now();
    let report = runner.run(&records).await;

    // 4 record gaps in batch one, one batch gap, 1 record gap in batch two.
    assert_eq!(started.elapsed(), Duration::from_secs(8));
    assert_eq!(report.updated, 7);
    assert_eq!(report.batches.len(), 2);
}

#[test]
fn fallback_requires_explicit_opt_in() {
    let config = SyncConfig::default();
    assert!(resolve_strategy::<FakeService>(None, &config).is_err());

    let allowed = SyncConfig {
        allow_fallback: true,
        ..SyncConfig::default()
    };
    let strategy = resolve_strategy::<FakeService>(None, &allowed).expect("fallback allowed");
    assert_eq!(strategy.label(), "fallback");

    let service = FakeService::default();
    let strategy = resolve_strategy(Some(&service), &config).expect("primary configured");
    assert_eq!(strategy.label(), "primary:fake-embedder");
}

#[tokio::test(flavor = "current_thread")]
async fn execute_sync_selects_only_stale_records() {
    let mut fresh = record("fresh", &["caramel"]);
    fresh.updated_at = Some(ts(2024, 1, 1));
    fresh.flavor_embedding = Some(vec![0.1; 4]);
    let mut edited = record("edited", &["peach"]);
    edited.updated_at = Some(ts(2024, 9, 1));
    edited.flavor_embedding = Some(vec![0.1; 4]);
    let mut never = record("never", &["hazelnut"]);
    never.updated_at = Some(ts(2024, 1, 1));
    let mut tagless = record("tagless", &[]);
    tagless.updated_at = Some(ts(2024, 9, 1));

    let gateway = FakeGateway {
        records: vec![fresh, edited, never, tagless],
        last_sync: Some(ts(2024, 6, 1)),
        ..FakeGateway::default()
    };
    let config = unpaced_config();

    let summary = execute_sync(
        &gateway,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        CancellationToken::new(),
    )
    .await
    .expect("sync runs");

    assert_eq!(summary.last_sync_at, Some(ts(2024, 6, 1)));
    assert_eq!(summary.catalog_records, 4);
    assert_eq!(
        summary.work_set,
        vec![RecordId::new("edited"), RecordId::new("never")]
    );
    assert_eq!(summary.skipped_empty, vec![RecordId::new("tagless")]);
    assert_eq!(gateway.written_ids(), vec!["edited", "never"]);
}

#[tokio::test(flavor = "current_thread")]
async fn unreadable_sync_log_treats_everything_as_stale() {
    let mut synced = record("synced", &["lemon"]);
    synced.updated_at = Some(ts(2020, 1, 1));
    synced.flavor_embedding = Some(vec![0.2; 4]);

    let gateway = FakeGateway {
        records: vec![synced],
        fail_log_read: true,
        ..FakeGateway::default()
    };
    let config = unpaced_config();

    let summary = execute_sync(
        &gateway,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        CancellationToken::new(),
    )
    .await
    .expect("sync runs");

    assert!(summary.last_sync_at.is_none());
    assert_eq!(summary.work_set, vec![RecordId::new("synced")]);
    assert_eq!(summary.report.updated, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn catalog_listing_failure_is_fatal() {
    let gateway = FakeGateway {
        fail_listing: true,
        ..FakeGateway::default()
    };
    let config = unpaced_config();

    let result = execute_sync(
        &gateway,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        CancellationToken::new(),
    )
    .await;

    assert!(result.is_err());
    assert!(gateway.runs.borrow().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn clean_run_is_logged_with_its_start_time() {
    let gateway = FakeGateway::with_records(numbered_records(3));
    let config = unpaced_config();

    let summary = execute_sync(
        &gateway,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        CancellationToken::new(),
    )
    .await
    .expect("sync runs");

    assert!(summary.sync_logged);
    let runs = gateway.runs.borrow();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].started_at, summary.started_at);
    assert_eq!(runs[0].updated_count, 3);
}

#[tokio::test(flavor = "current_thread")]
async fn failed_dry_or_cancelled_runs_are_not_logged() {
    let config = unpaced_config();

    let failing = FakeGateway {
        records: numbered_records(2),
        reject: HashSet::from(["c02".to_string()]),
        ..FakeGateway::default()
    };
    let summary = execute_sync(
        &failing,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        CancellationToken::new(),
    )
    .await
    .expect("sync runs");
    assert!(!summary.sync_logged);
    assert!(failing.runs.borrow().is_empty());

    let dry = FakeGateway::with_records(numbered_records(2));
    let dry_config = SyncConfig {
        dry_run: true,
        ..unpaced_config()
    };
    let summary = execute_sync(
        &dry,
        EmbeddingStrategy::<FakeService>::Fallback,
        &dry_config,
        CancellationToken::new(),
    )
    .await
    .expect("sync runs");
    assert_eq!(summary.report.updated, 2);
    assert!(dry.runs.borrow().is_empty());

    let cancelled = FakeGateway::with_records(numbered_records(2));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let service = FakeService::default();
    let summary = execute_sync(
        &cancelled,
        EmbeddingStrategy::Primary(&service),
        &config,
        cancel,
    )
    .await
    .expect("sync runs");
    assert_eq!(summary.outcome(), RunOutcome::Cancelled);
    assert_eq!(summary.report.updated, 0);
    assert!(cancelled.runs.borrow().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn manifest_describes_the_run() {
    let gateway = FakeGateway {
        records: vec![
            record("a", &["berry"]),
            record("b", &[]),
            record("c", &["cocoa"]),
        ],
        reject: HashSet::from(["c".to_string()]),
        ..FakeGateway::default()
    };
    let config = unpaced_config();

    let summary = execute_sync(
        &gateway,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        CancellationToken::new(),
    )
    .await
    .expect("sync runs");
    let manifest = build_manifest(&summary, &config);

    assert_eq!(manifest.generator, "fallback");
    assert_eq!(manifest.status, "completed");
    assert_eq!(manifest.work_set_size, 2);
    assert_eq!(manifest.work_set_digest, record_ids_digest(&summary.work_set));
    assert_eq!(manifest.skipped_empty_tags, vec!["b"]);
    assert_eq!(manifest.updated_count, 1);
    assert_eq!(manifest.failed_count, 2);
    assert_eq!(manifest.failed_records, vec!["c"]);
    assert!(!manifest.sync_logged);
    assert!(manifest.run_id.starts_with("sync-"));
    assert_eq!(manifest.batches.len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn sqlite_catalog_round_trip_settles_after_one_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gateway =
        SqliteGateway::create(&dir.path().join("catalog.sqlite")).expect("catalog created");
    let edited = Some(ts(2024, 3, 1));
    gateway
        .insert_record("1", "Kenya AA", &["blackcurrant", "tomato"], edited, None)
        .expect("inserted");
    gateway
        .insert_record("2", "Brazil Cerrado", &["peanut", "milk chocolate"], edited, None)
        .expect("inserted");
    gateway
        .insert_record("3", "Mystery Lot", &[], edited, None)
        .expect("inserted");
    let config = unpaced_config();

    let first = execute_sync(
        &gateway,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        CancellationToken::new(),
    )
    .await
    .expect("first sync runs");
    assert_eq!(first.report.updated, 2);
    assert_eq!(first.skipped_empty, vec![RecordId::new("3")]);
    assert!(first.sync_logged);

    let stored = gateway
        .stored_embedding("1")
        .expect("read")
        .expect("embedding written");
    assert_eq!(decode_vector(&stored).expect("decodes").len(), EMBEDDING_DIM);
    assert!(gateway.stored_embedding("3").expect("read").is_none());

    let second = execute_sync(
        &gateway,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        CancellationToken::new(),
    )
    .await
    .expect("second sync runs");
    // The log keeps whole seconds, rounding the start down.
    assert_eq!(
        second.last_sync_at.map(utc_string),
        Some(utc_string(first.started_at))
    );
    assert!(second.work_set.is_empty());
    assert_eq!(second.report.updated, 0);
}

#[tokio::test(flavor = "current_thread")]
async fn tagless_records_count_as_failed_without_blocking_the_sync_log() {
    let gateway = FakeGateway::with_records(vec![
        record("a", &["berry"]),
        record("b", &[]),
        record("c", &["cocoa"]),
    ]);
    let config = unpaced_config();

    let summary = execute_sync(
        &gateway,
        EmbeddingStrategy::<FakeService>::Fallback,
        &config,
        CancellationToken::new(),
    )
    .await
    .expect("sync runs");

    assert_eq!(summary.report.updated, 2);
    assert_eq!(summary.report.failed, 0);
    assert_eq!(summary.failed_total(), 1);
    assert!(summary.sync_logged);
    assert_eq!(gateway.runs.borrow().len(), 1);
}
