//! In-memory [`ManualRepository`] for tests and WASM targets.
//!
//! All tables live behind one `std::sync::Mutex`, so each trait call sees
//! and mutates a consistent snapshot; that is what makes
//! [`commit_approval`](ManualRepository::commit_approval) atomic here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ApprovalCommit, CommitOutcome, DeleteOutcome, EntryFilter, ManualRepository, TaskAnnotation,
    TaskInsert,
};
use crate::models::{
    Consultation, LogicalKey, ManualContent, ManualEntry, ManualStatus, ManualVersion,
    ReviewTask, TaskEvent, TaskStatus,
};

#[derive(Default)]
struct Tables {
    consultations: HashMap<String, Consultation>,
    entries: HashMap<String, ManualEntry>,
    versions: Vec<ManualVersion>,
    tasks: Vec<ReviewTask>,
}

impl Tables {
    fn latest_version_where(&self, pred: impl Fn(&ManualVersion) -> bool) -> Option<ManualVersion> {
        self.versions
            .iter()
            .filter(|v| pred(v))
            .max_by(|a, b| a.label.cmp(&b.label).then(a.approved_at.cmp(&b.approved_at)))
            .cloned()
    }

    fn open_task_for(&self, entry_id: &str) -> Option<&ReviewTask> {
        self.tasks
            .iter()
            .find(|t| t.new_entry_id == entry_id && t.status == TaskStatus::Todo)
    }
}

#[derive(Default)]
pub struct InMemoryRepository {
    tables: Mutex<Tables>,
    fail_commits: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_consultation(&self, consultation: Consultation) {
        self.tables
            .lock()
            .unwrap()
            .consultations
            .insert(consultation.id.clone(), consultation);
    }

    /// Make `commit_approval` fail before touching any table.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn version_count(&self) -> usize {
        self.tables.lock().unwrap().versions.len()
    }

    pub fn task_count(&self) -> usize {
        self.tables.lock().unwrap().tasks.len()
    }
}

fn apply_event(task: &mut ReviewTask, event: &TaskEvent) {
    task.status = event.to;
    task.updated_at = event.at;
    task.history.push(event.clone());
}

#[async_trait]
impl ManualRepository for InMemoryRepository {
    async fn get_consultation(&self, id: &str) -> Result<Option<Consultation>> {
        Ok(self.tables.lock().unwrap().consultations.get(id).cloned())
    }

    async fn insert_entry(&self, entry: &ManualEntry) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.entries.contains_key(&entry.id) {
            bail!("duplicate manual entry id: {}", entry.id);
        }
        if entry.status == ManualStatus::Approved
            && tables
                .entries
                .values()
                .any(|e| e.key == entry.key && e.status == ManualStatus::Approved)
        {
            bail!("an approved manual already exists for {}", entry.key);
        }
        tables.entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn get_entry(&self, id: &str) -> Result<Option<ManualEntry>> {
        Ok(self.tables.lock().unwrap().entries.get(id).cloned())
    }

    async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<ManualEntry>> {
        let tables = self.tables.lock().unwrap();
        let mut entries: Vec<ManualEntry> = tables
            .entries
            .values()
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .filter(|e| {
                filter
                    .business_type
                    .as_deref()
                    .map_or(true, |bt| e.key.business_type == bt)
            })
            .filter(|e| {
                filter
                    .error_code
                    .as_deref()
                    .map_or(true, |ec| e.key.error_code == ec)
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn find_approved_by_logical_key(&self, key: &LogicalKey) -> Result<Vec<ManualEntry>> {
        self.list_entries(&EntryFilter {
            status: Some(ManualStatus::Approved),
            business_type: Some(key.business_type.clone()),
            error_code: Some(key.error_code.clone()),
        })
        .await
    }

    async fn update_draft_content(
        &self,
        id: &str,
        content: &ManualContent,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        match tables.entries.get_mut(id) {
            Some(entry) if entry.status == ManualStatus::Draft => {
                entry.content = content.clone();
                entry.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit_approval(&self, commit: &ApprovalCommit) -> Result<CommitOutcome> {
        if self.fail_commits.load(Ordering::SeqCst) {
            bail!("in-memory repository: commits disabled");
        }
        let mut tables = self.tables.lock().unwrap();

        // Check every precondition before the first write.
        match tables.entries.get(&commit.entry_id) {
            Some(e) if e.status == ManualStatus::Draft => {}
            _ => return Ok(CommitOutcome::EntryNotDraft),
        }
        let latest = tables
            .latest_version_where(|v| v.key == commit.key)
            .map(|v| v.label);
        if latest != commit.previous_label {
            return Ok(CommitOutcome::LineageMoved);
        }
        if let Some(closure) = &commit.task {
            let open = tables
                .tasks
                .iter()
                .any(|t| t.id == closure.task_id && t.status == TaskStatus::Todo);
            if !open {
                return Ok(CommitOutcome::TaskNotOpen);
            }
        }

        let at = commit.version.approved_at;
        let mut deprecated = Vec::new();
        for entry in tables.entries.values_mut() {
            if entry.id != commit.entry_id
                && entry.key == commit.key
                && entry.status == ManualStatus::Approved
            {
                entry.status = ManualStatus::Deprecated;
                entry.updated_at = at;
                deprecated.push(entry.id.clone());
            }
        }
        deprecated.sort();

        if let Some(entry) = tables.entries.get_mut(&commit.entry_id) {
            entry.status = ManualStatus::Approved;
            entry.version = Some(commit.version.label);
            entry.approved_at = Some(at);
            entry.updated_at = at;
        }
        tables.versions.push(commit.version.clone());

        if let Some(closure) = &commit.task {
            if let Some(task) = tables.tasks.iter_mut().find(|t| t.id == closure.task_id) {
                apply_event(task, &closure.event);
            }
        }

        Ok(CommitOutcome::Committed { deprecated })
    }

    async fn deprecate_entry(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        match tables.entries.get_mut(id) {
            Some(entry) if entry.status == ManualStatus::Approved => {
                entry.status = ManualStatus::Deprecated;
                entry.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_draft(&self, id: &str) -> Result<DeleteOutcome> {
        let mut tables = self.tables.lock().unwrap();
        let status = match tables.entries.get(id) {
            None => return Ok(DeleteOutcome::NotFound),
            Some(e) => e.status,
        };
        if status != ManualStatus::Draft {
            return Ok(DeleteOutcome::NotDraft(status));
        }
        let before = tables.tasks.len();
        tables
            .tasks
            .retain(|t| !(t.new_entry_id == id && t.status == TaskStatus::Todo));
        let removed_tasks = (before - tables.tasks.len()) as u64;
        tables.entries.remove(id);
        Ok(DeleteOutcome::Deleted { removed_tasks })
    }

    async fn find_latest_version(&self, entry_id: &str) -> Result<Option<ManualVersion>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .latest_version_where(|v| v.entry_id == entry_id))
    }

    async fn find_latest_version_for_key(
        &self,
        key: &LogicalKey,
    ) -> Result<Option<ManualVersion>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .latest_version_where(|v| &v.key == key))
    }

    async fn list_versions(&self, entry_id: &str) -> Result<Vec<ManualVersion>> {
        let tables = self.tables.lock().unwrap();
        let mut versions: Vec<ManualVersion> = tables
            .versions
            .iter()
            .filter(|v| v.entry_id == entry_id)
            .cloned()
            .collect();
        versions.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(versions)
    }

    async fn insert_task(&self, task: &ReviewTask) -> Result<TaskInsert> {
        let mut tables = self.tables.lock().unwrap();
        if task.status == TaskStatus::Todo {
            if let Some(existing) = tables.open_task_for(&task.new_entry_id) {
                return Ok(TaskInsert::AlreadyOpen(existing.id.clone()));
            }
        }
        tables.tasks.push(task.clone());
        Ok(TaskInsert::Inserted)
    }

    async fn get_task(&self, id: &str) -> Result<Option<ReviewTask>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn find_open_task_for_entry(&self, entry_id: &str) -> Result<Option<ReviewTask>> {
        Ok(self.tables.lock().unwrap().open_task_for(entry_id).cloned())
    }

    async fn transition_task(&self, id: &str, event: &TaskEvent) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        match tables.tasks.iter_mut().find(|t| t.id == id) {
            Some(task) if Some(task.status) == event.from => {
                apply_event(task, event);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn annotate_task(&self, id: &str, annotation: &TaskAnnotation) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        let task = match tables.tasks.iter_mut().find(|t| t.id == id) {
            Some(task) if task.status == TaskStatus::Todo => task,
            _ => return Ok(false),
        };
        if let Some(matched) = &annotation.matched {
            if task.old_entry_id.is_some() {
                return Ok(false);
            }
            task.old_entry_id = Some(matched.old_entry_id.clone());
            task.similarity_score = Some(matched.similarity_score);
            task.differences = matched.differences.clone();
        }
        apply_event(task, &annotation.event);
        Ok(true)
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<ReviewTask>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .tasks
            .iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect())
    }
}
