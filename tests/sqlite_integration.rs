//! Integration tests for the SQLite adapters and the engine running on them.
//!
//! Embeddings come from [`VocabEmbedder`], which gives every distinct word
//! its own dimension. Cosine similarity between two manuals is then exactly
//! `shared words / sqrt(words_a * words_b)`, so scores are predictable.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use manual_kb::config::{load_config, Config};
use manual_kb::embedding::EmbeddingProvider;
use manual_kb::retry_queue::SqliteRetryQueue;
use manual_kb::sqlite_repo::SqliteManualRepository;
use manual_kb::vector_index::SqliteVectorIndex;
use manual_kb::{db, migrate};
use manual_kb_core::conflict::ConflictKind;
use manual_kb_core::generation::scripted::ScriptedDrafter;
use manual_kb_core::generation::Comparison;
use manual_kb_core::index::{IndexMetadata, IndexQuery, MetadataFilter, SimilarityIndex};
use manual_kb_core::lifecycle::{AuthoredDraft, DraftOptions, DraftSource, IndexSync};
use manual_kb_core::models::{
    Consultation, LogicalKey, ManualContent, ManualEntry, ManualStatus, ManualVersion,
    ReviewTask, TaskEvent, TaskReason, TaskStatus,
};
use manual_kb_core::queue::{entry_payload, RetryJobKind, RetryQueue};
use manual_kb_core::repository::{
    ApprovalCommit, CommitOutcome, DeleteOutcome, EntryFilter, ManualRepository, TaskAnnotation,
    TaskInsert, TaskMatch,
};
use manual_kb_core::version::VersionLabel;
use manual_kb_core::{Collaborators, Engine};

const DIMS: usize = 256;

struct VocabEmbedder {
    vocab: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl VocabEmbedder {
    fn new() -> Self {
        Self {
            vocab: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut vocab = self.vocab.lock().unwrap();
        let mut v = vec![0.0f32; DIMS];
        for word in text.split(|c: char| c.is_whitespace() || c == ',') {
            if word.is_empty() || word.starts_with('[') {
                continue;
            }
            let next = vocab.len();
            let slot = *vocab.entry(word.to_string()).or_insert(next);
            v[slot] = 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for VocabEmbedder {
    fn model_name(&self) -> &str {
        "vocab-test"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

fn test_config(tmp: &TempDir) -> Config {
    let path = tmp.path().join("mkb.toml");
    fs::write(
        &path,
        format!("[db]\npath = \"{}/data/mkb.sqlite\"\n", tmp.path().display()),
    )
    .unwrap();
    load_config(&path).unwrap()
}

async fn setup() -> (TempDir, sqlx::SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    (tmp, pool)
}

struct Harness {
    engine: Engine,
    repo: Arc<SqliteManualRepository>,
    vectors: Arc<SqliteVectorIndex>,
    embedder: Arc<VocabEmbedder>,
    drafter: Arc<ScriptedDrafter>,
    queue: Arc<SqliteRetryQueue>,
}

fn harness(pool: &sqlx::SqlitePool) -> Harness {
    let repo = Arc::new(SqliteManualRepository::new(pool.clone()));
    let embedder = Arc::new(VocabEmbedder::new());
    let vectors = Arc::new(SqliteVectorIndex::new(pool.clone(), embedder.clone()));
    let drafter = Arc::new(ScriptedDrafter::new());
    let queue = Arc::new(SqliteRetryQueue::new(pool.clone()));
    let engine = Engine::new(
        Collaborators {
            repository: repo.clone(),
            index: vectors.clone(),
            drafter: drafter.clone(),
            retry_queue: queue.clone(),
        },
        Default::default(),
    )
    .unwrap();
    Harness {
        engine,
        repo,
        vectors,
        embedder,
        drafter,
        queue,
    }
}

fn content(guideline: &str) -> ManualContent {
    ManualContent {
        keywords: vec!["CVV".into()],
        topic: "CVV 인증 실패".into(),
        background: "결제 오류".into(),
        guideline: guideline.into(),
    }
}

fn authored(key: &LogicalKey, content: ManualContent) -> DraftSource {
    DraftSource::Authored(AuthoredDraft {
        key: key.clone(),
        content,
        source_consultation_id: None,
    })
}

fn card_key() -> LogicalKey {
    LogicalKey::new("CARD", "E401")
}

// ─── Repository ─────────────────────────────────────────────────────

#[tokio::test]
async fn entry_round_trips_and_filters() {
    let (_tmp, pool) = setup().await;
    let repo = SqliteManualRepository::new(pool);

    let a = ManualEntry::new_draft(card_key(), content("재등록"), Some("c-1".into()));
    let b = ManualEntry::new_draft(LogicalKey::new("LOAN", "E1"), content("상담"), None);
    repo.insert_entry(&a).await.unwrap();
    repo.insert_entry(&b).await.unwrap();

    let loaded = repo.get_entry(&a.id).await.unwrap().unwrap();
    assert_eq!(loaded.key, a.key);
    assert_eq!(loaded.content, a.content);
    assert_eq!(loaded.status, ManualStatus::Draft);
    assert_eq!(loaded.source_consultation_id.as_deref(), Some("c-1"));
    assert_eq!(loaded.created_at.timestamp_millis(), a.created_at.timestamp_millis());

    let card = repo
        .list_entries(&EntryFilter {
            business_type: Some("CARD".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(card.len(), 1);
    assert_eq!(card[0].id, a.id);

    assert!(repo.get_entry("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn consultation_upsert_reports_new_ids() {
    let (_tmp, pool) = setup().await;
    let repo = SqliteManualRepository::new(pool);
    let mut c = Consultation {
        id: "c-1".into(),
        summary: "CVV 인증 실패".into(),
        inquiry: "결제가 안 됩니다".into(),
        action_taken: "카드 재등록 안내".into(),
        branch: Some("강남".into()),
        business_type: "CARD".into(),
        error_code: "E401".into(),
    };
    assert!(repo.upsert_consultation(&c).await.unwrap());
    c.action_taken = "재발급 안내".into();
    assert!(!repo.upsert_consultation(&c).await.unwrap());

    let stored = repo.get_consultation("c-1").await.unwrap().unwrap();
    assert_eq!(stored.action_taken, "재발급 안내");
    assert_eq!(stored.branch.as_deref(), Some("강남"));
}

#[tokio::test]
async fn commit_refuses_stale_lineage_and_writes_nothing() {
    let (_tmp, pool) = setup().await;
    let repo = SqliteManualRepository::new(pool);
    let draft = ManualEntry::new_draft(card_key(), content("재등록"), None);
    repo.insert_entry(&draft).await.unwrap();

    let commit = |previous: Option<VersionLabel>, label: VersionLabel| ApprovalCommit {
        entry_id: draft.id.clone(),
        key: draft.key.clone(),
        version: ManualVersion {
            id: uuid::Uuid::new_v4().to_string(),
            entry_id: draft.id.clone(),
            key: draft.key.clone(),
            label,
            snapshot: draft.content.clone(),
            approved_by: "kim".into(),
            approved_at: Utc::now(),
        },
        previous_label: previous,
        task: None,
    };

    let stale = commit(Some(VersionLabel::new(1, 0)), VersionLabel::new(1, 1));
    assert_eq!(
        repo.commit_approval(&stale).await.unwrap(),
        CommitOutcome::LineageMoved
    );
    assert!(repo.get_entry(&draft.id).await.unwrap().unwrap().is_draft());
    assert!(repo.list_versions(&draft.id).await.unwrap().is_empty());

    let fresh = commit(None, VersionLabel::INITIAL);
    assert_eq!(
        repo.commit_approval(&fresh).await.unwrap(),
        CommitOutcome::Committed { deprecated: vec![] }
    );
    assert_eq!(
        repo.commit_approval(&fresh).await.unwrap(),
        CommitOutcome::EntryNotDraft
    );
    let latest = repo.find_latest_version_for_key(&draft.key).await.unwrap().unwrap();
    assert_eq!(latest.label, VersionLabel::INITIAL);
    assert_eq!(latest.snapshot, draft.content);
}

#[tokio::test]
async fn one_open_task_per_draft_and_transitions_are_compare_and_set() {
    let (_tmp, pool) = setup().await;
    let repo = SqliteManualRepository::new(pool);
    let draft = ManualEntry::new_draft(card_key(), content("재등록"), None);
    repo.insert_entry(&draft).await.unwrap();

    let first = ReviewTask::open(&draft.id, None, TaskReason::Conflict, Some(0.8), None, None);
    let second = ReviewTask::open(&draft.id, None, TaskReason::Ungrounded, None, None, None);
    assert_eq!(repo.insert_task(&first).await.unwrap(), TaskInsert::Inserted);
    assert_eq!(
        repo.insert_task(&second).await.unwrap(),
        TaskInsert::AlreadyOpen(first.id.clone())
    );

    let reject = TaskEvent::transition(
        "lee",
        TaskStatus::Todo,
        TaskStatus::Rejected,
        Some("중복".into()),
    );
    assert!(repo.transition_task(&first.id, &reject).await.unwrap());
    assert!(!repo.transition_task(&first.id, &reject).await.unwrap());

    let task = repo.get_task(&first.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Rejected);
    assert_eq!(task.history.len(), 2);
    assert_eq!(task.history[1].actor, "lee");
    assert_eq!(task.history[1].notes.as_deref(), Some("중복"));

    // The rejected task no longer blocks a new one.
    assert_eq!(repo.insert_task(&second).await.unwrap(), TaskInsert::Inserted);
    assert_eq!(repo.list_tasks(Some(TaskStatus::Todo)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn annotation_records_match_on_unmatched_todo_task() {
    let (_tmp, pool) = setup().await;
    let repo = SqliteManualRepository::new(pool);
    let draft = ManualEntry::new_draft(card_key(), content("재등록"), None);
    repo.insert_entry(&draft).await.unwrap();
    let task = ReviewTask::open(
        &draft.id,
        None,
        TaskReason::Ungrounded,
        None,
        Some(vec!["keyword not in source: 해킹".into()]),
        None,
    );
    repo.insert_task(&task).await.unwrap();

    let matched = TaskAnnotation {
        matched: Some(TaskMatch {
            old_entry_id: "approved-1".into(),
            similarity_score: 0.8,
            differences: Some(vec!["재등록 절차 추가".into()]),
        }),
        event: TaskEvent::note("system", TaskStatus::Todo, "기존 매뉴얼과 겹침"),
    };
    assert!(repo.annotate_task(&task.id, &matched).await.unwrap());
    assert!(!repo.annotate_task(&task.id, &matched).await.unwrap());

    let stored = repo.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Todo);
    assert_eq!(stored.old_entry_id.as_deref(), Some("approved-1"));
    assert_eq!(stored.similarity_score, Some(0.8));
    assert_eq!(
        stored.differences,
        Some(vec!["재등록 절차 추가".to_string()])
    );
    assert_eq!(stored.history.len(), 2);
    assert_eq!(stored.history[1].notes.as_deref(), Some("기존 매뉴얼과 겹침"));

    let done = TaskEvent::transition("lee", TaskStatus::Todo, TaskStatus::Done, None);
    assert!(repo.transition_task(&task.id, &done).await.unwrap());
    let note = TaskAnnotation {
        matched: None,
        event: TaskEvent::note("system", TaskStatus::Todo, "late"),
    };
    assert!(!repo.annotate_task(&task.id, &note).await.unwrap());
    assert_eq!(repo.get_task(&task.id).await.unwrap().unwrap().history.len(), 3);
}

#[tokio::test]
async fn delete_draft_removes_open_tasks_only_for_drafts() {
    let (_tmp, pool) = setup().await;
    let h = harness(&pool);

    let draft = ManualEntry::new_draft(card_key(), content("재등록"), None);
    h.repo.insert_entry(&draft).await.unwrap();
    let task = ReviewTask::open(&draft.id, None, TaskReason::Conflict, None, None, None);
    h.repo.insert_task(&task).await.unwrap();

    assert_eq!(
        h.repo.delete_draft(&draft.id).await.unwrap(),
        DeleteOutcome::Deleted { removed_tasks: 1 }
    );
    assert!(h.repo.get_task(&task.id).await.unwrap().is_none());
    assert_eq!(
        h.repo.delete_draft(&draft.id).await.unwrap(),
        DeleteOutcome::NotFound
    );

    let approved = h
        .engine
        .lifecycle
        .create_draft(authored(&card_key(), content("재발급")), &DraftOptions::default())
        .await
        .unwrap()
        .entry;
    h.engine.lifecycle.approve(&approved.id, "kim").await.unwrap();
    assert_eq!(
        h.repo.delete_draft(&approved.id).await.unwrap(),
        DeleteOutcome::NotDraft(ManualStatus::Approved)
    );
}

// ─── Retry queue ────────────────────────────────────────────────────

#[tokio::test]
async fn retry_queue_counts_attempts_and_stops_claiming_dead_jobs() {
    let (_tmp, pool) = setup().await;
    let queue = SqliteRetryQueue::new(pool);

    let a = queue
        .enqueue(RetryJobKind::IndexEntry, entry_payload("m-1"))
        .await
        .unwrap();
    let b = queue
        .enqueue(RetryJobKind::RemoveFromIndex, entry_payload("m-2"))
        .await
        .unwrap();

    queue.fail(&a, "timeout", false).await.unwrap();
    queue.fail(&b, "timeout", true).await.unwrap();

    let due = queue.claim_due(10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, a);
    assert_eq!(due[0].kind, RetryJobKind::IndexEntry);
    assert_eq!(due[0].attempts, 1);
    assert_eq!(due[0].last_error.as_deref(), Some("timeout"));
    assert_eq!(due[0].entry_id(), Some("m-1"));

    queue.complete(&a).await.unwrap();
    assert!(queue.claim_due(10).await.unwrap().is_empty());
    assert!(queue.complete("missing").await.is_err());
}

// ─── Vector index ───────────────────────────────────────────────────

#[tokio::test]
async fn vector_index_skips_unchanged_text_and_filters_by_key() {
    let (_tmp, pool) = setup().await;
    let embedder = Arc::new(VocabEmbedder::new());
    let index = SqliteVectorIndex::new(pool, embedder.clone());
    let card = IndexMetadata::from(&card_key());
    let loan = IndexMetadata::from(&LogicalKey::new("LOAN", "E1"));

    index.index("a", "카드 재등록 안내", &card).await.unwrap();
    index.index("a", "카드 재등록 안내", &card).await.unwrap();
    assert_eq!(embedder.calls(), 1);
    index.index("b", "카드 재등록 안내", &loan).await.unwrap();
    assert_eq!(index.len().await.unwrap(), 2);

    let filter = MetadataFilter::for_key(&card_key());
    let hits = index
        .search(&IndexQuery {
            text: "카드 재등록 안내",
            top_k: 5,
            filter: Some(&filter),
            threshold: Some(0.5),
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "a");
    assert!((hits[0].score - 1.0).abs() < 1e-6);

    let none = index
        .search(&IndexQuery {
            text: "대출 상환",
            top_k: 5,
            filter: None,
            threshold: Some(0.5),
        })
        .await
        .unwrap();
    assert!(none.is_empty());

    index.delete("a").await.unwrap();
    index.delete("a").await.unwrap();
    assert_eq!(index.len().await.unwrap(), 1);
}

// ─── Engine over SQLite ─────────────────────────────────────────────

#[tokio::test]
async fn approval_lineage_conflicts_and_review_over_sqlite() {
    let (_tmp, pool) = setup().await;
    let h = harness(&pool);
    let key = card_key();

    // First manual: NEW, approved as 1.0 and indexed.
    let first = h
        .engine
        .lifecycle
        .create_draft(authored(&key, content("카드 재등록 안내")), &DraftOptions::default())
        .await
        .unwrap();
    assert_eq!(first.conflict.kind, ConflictKind::New);
    let approved = h.engine.lifecycle.approve(&first.entry.id, "kim").await.unwrap();
    assert_eq!(approved.version.label, VersionLabel::new(1, 0));
    assert_eq!(approved.index, IndexSync::Synced);
    assert_eq!(h.vectors.len().await.unwrap(), 1);

    // Identical text: SIMILAR, no task.
    let dup = h
        .engine
        .lifecycle
        .create_draft(authored(&key, content("카드 재등록 안내")), &DraftOptions::default())
        .await
        .unwrap();
    assert_eq!(dup.conflict.kind, ConflictKind::Similar);
    assert_eq!(
        dup.conflict.matched_entry.as_ref().map(|e| e.id.as_str()),
        Some(first.entry.id.as_str())
    );
    assert!(dup.review_task_id.is_none());

    // Six of the words shared (8 vs 7 distinct): cosine ~0.80, SUPPLEMENT.
    h.drafter.set_comparison(Comparison {
        differences: vec!["안내 -> 재발급".into()],
        summary: "조치 변경".into(),
    });
    let supplement = h
        .engine
        .lifecycle
        .create_draft(authored(&key, content("카드 재발급")), &DraftOptions::default())
        .await
        .unwrap();
    assert_eq!(supplement.conflict.kind, ConflictKind::Supplement);
    let score = supplement.conflict.similarity_score.unwrap();
    assert!((score - 6.0 / 56f64.sqrt()).abs() < 1e-4, "score was {}", score);
    let task_id = supplement.review_task_id.clone().unwrap();

    // Approving the task approves the draft as 1.1 and retires 1.0.
    let decision = h
        .engine
        .review
        .approve_task(&task_id, "park", Some("최신 절차".into()))
        .await
        .unwrap();
    assert_eq!(decision.task.status, TaskStatus::Done);
    let approval = decision.approval.unwrap();
    assert_eq!(approval.version.label, VersionLabel::new(1, 1));
    assert_eq!(approval.deprecated, vec![first.entry.id.clone()]);

    let old = h.repo.get_entry(&first.entry.id).await.unwrap().unwrap();
    assert_eq!(old.status, ManualStatus::Deprecated);
    assert_eq!(h.repo.find_approved_by_logical_key(&key).await.unwrap().len(), 1);
    assert_eq!(h.vectors.len().await.unwrap(), 1);

    // Search sees only the approved successor.
    let hits = h
        .engine
        .search
        .search_manuals("CVV 인증 실패 결제 오류 카드 재발급", &MetadataFilter::default(), 5)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entry.id, supplement.entry.id);

    // The near-duplicate draft is still pending and can be deleted.
    assert_eq!(h.engine.lifecycle.delete(&dup.entry.id).await.unwrap(), 0);
    assert!(h.queue.claim_due(10).await.unwrap().is_empty());
    assert!(h.embedder.calls() > 0);
}

#[tokio::test]
async fn rebuild_restores_vectors_for_approved_manuals() {
    let (_tmp, pool) = setup().await;
    let h = harness(&pool);

    let outcome = h
        .engine
        .lifecycle
        .create_draft(authored(&card_key(), content("카드 재등록 안내")), &DraftOptions::default())
        .await
        .unwrap();
    h.engine.lifecycle.approve(&outcome.entry.id, "kim").await.unwrap();

    sqlx::query("DELETE FROM manual_vectors")
        .execute(&pool)
        .await
        .unwrap();
    assert!(h.vectors.is_empty().await.unwrap());

    let report = h.engine.maintenance.rebuild_index().await.unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(h.vectors.len().await.unwrap(), 1);
}
