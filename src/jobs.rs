use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Semaphore;
use tokio::task::JoinError;

use crate::errors::PipelineError;
use crate::indexer::{BatchIndexer, FolderReport};
use crate::reference::ImageReference;

/// Job identifier; ULIDs sort by submission time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        JobId(rusty_ulid::Ulid::generate().to_string())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Job {
    /// Scan a folder and index its survivors batch by batch.
    IndexFolder { folder: String, batch_size: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running { processed: usize, total: usize },
    Done { report: FolderReport },
    Failed { error: String },
    Cancelled { report: Option<FolderReport> },
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Done { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled { .. }
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job: Job,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
}

struct JobEntry {
    record: JobRecord,
    cancel: Arc<AtomicBool>,
}

type JobTable = Arc<RwLock<BTreeMap<JobId, JobEntry>>>;

fn read(table: &JobTable) -> RwLockReadGuard<'_, BTreeMap<JobId, JobEntry>> {
    table.read().unwrap_or_else(|e| e.into_inner())
}

fn write(table: &JobTable) -> RwLockWriteGuard<'_, BTreeMap<JobId, JobEntry>> {
    table.write().unwrap_or_else(|e| e.into_inner())
}

fn set_status(table: &JobTable, id: &JobId, status: JobStatus) {
    if let Some(entry) = write(table).get_mut(id) {
        entry.record.status = status;
    }
}

/// Map a finished indexing task onto the job's final status. A panicked
/// task fails the job instead of leaving it running.
fn final_status(
    id: &JobId,
    outcome: Result<Result<FolderReport, PipelineError>, JoinError>,
) -> JobStatus {
    match outcome {
        Ok(Ok(report)) if report.cancelled => JobStatus::Cancelled {
            report: Some(report),
        },
        Ok(Ok(report)) => JobStatus::Done { report },
        Ok(Err(e)) => {
            log::error!("[jobs] {id} failed: {e}");
            JobStatus::Failed {
                error: e.to_string(),
            }
        }
        Err(e) => {
            log::error!("[jobs] {id} aborted: {e}");
            JobStatus::Failed {
                error: format!("indexing task aborted: {e}"),
            }
        }
    }
}

/// Runs submitted jobs on the tokio runtime, at most `max_concurrent` at a
/// time. Finished jobs stay queryable.
pub struct JobRunner {
    indexer: Arc<BatchIndexer>,
    jobs: JobTable,
    slots: Arc<Semaphore>,
}

impl JobRunner {
    pub fn new(indexer: Arc<BatchIndexer>, max_concurrent: usize) -> Self {
        Self {
            indexer,
            jobs: Arc::new(RwLock::new(BTreeMap::new())),
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Queue a job and return immediately.
    pub fn submit(&self, job: Job) -> Result<JobId, PipelineError> {
        let Job::IndexFolder { folder, batch_size } = &job;
        let root: ImageReference = folder.parse()?;
        let batch_size = *batch_size;

        let id = JobId::new();
        let cancel = Arc::new(AtomicBool::new(false));
        write(&self.jobs).insert(
            id.clone(),
            JobEntry {
                record: JobRecord {
                    id: id.clone(),
                    job: job.clone(),
                    status: JobStatus::Pending,
                    submitted_at: Utc::now(),
                },
                cancel: cancel.clone(),
            },
        );
        log::info!("[jobs] queued {id}: index {root}");

        let jobs = self.jobs.clone();
        let slots = self.slots.clone();
        let indexer = self.indexer.clone();
        let task_id = id.clone();

        tokio::spawn(async move {
            let id = task_id;
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    set_status(&jobs, &id, JobStatus::Failed { error: e.to_string() });
                    return;
                }
            };

            if cancel.load(Ordering::SeqCst) {
                log::info!("[jobs] {id} cancelled before start");
                set_status(&jobs, &id, JobStatus::Cancelled { report: None });
                return;
            }

            set_status(&jobs, &id, JobStatus::Running { processed: 0, total: 0 });
            log::info!("[jobs] started {id}");

            let progress = {
                let jobs = jobs.clone();
                let id = id.clone();
                move |processed: usize, total: usize| {
                    set_status(&jobs, &id, JobStatus::Running { processed, total })
                }
            };

            let run = tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    indexer
                        .index_folder(&root, batch_size, &cancel, progress)
                        .await
                }
            });
            let status = final_status(&id, run.await);

            log::info!("[jobs] finished {id}");
            set_status(&jobs, &id, status);
        });

        Ok(id)
    }

    pub fn status(&self, id: &JobId) -> Option<JobRecord> {
        read(&self.jobs).get(id).map(|entry| entry.record.clone())
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        read(&self.jobs)
            .values()
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Request cooperative cancellation. The batch in flight completes and
    /// no further batch starts. Returns the job's status at the time of the
    /// request, or `None` for an unknown id.
    pub fn cancel(&self, id: &JobId) -> Option<JobStatus> {
        let jobs = read(&self.jobs);
        let entry = jobs.get(id)?;
        if !entry.record.status.is_finished() {
            entry.cancel.store(true, Ordering::SeqCst);
            log::info!("[jobs] cancellation requested for {id}");
        }
        Some(entry.record.status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_unique_and_ordered() {
        let a = JobId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = JobId::new();
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(a.to_string().len(), 26);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(JobStatus::Running {
            processed: 3,
            total: 10,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"state": "running", "processed": 3, "total": 10})
        );

        let json = serde_json::to_value(JobStatus::Pending).unwrap();
        assert_eq!(json, serde_json::json!({"state": "pending"}));
    }

    #[test]
    fn test_finished_states() {
        assert!(!JobStatus::Pending.is_finished());
        assert!(!JobStatus::Running { processed: 0, total: 1 }.is_finished());
        assert!(JobStatus::Failed { error: "x".into() }.is_finished());
        assert!(JobStatus::Cancelled { report: None }.is_finished());
    }

    #[tokio::test]
    async fn test_panicked_task_fails_the_job() {
        let handle = tokio::spawn(async {
            if true {
                panic!("indexer blew up");
            }
            Ok::<_, PipelineError>(FolderReport::default())
        });
        let status = final_status(&JobId::from("j1"), handle.await);
        match status {
            JobStatus::Failed { error } => assert!(error.contains("aborted")),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_final_status_of_cancelled_run_keeps_report() {
        let report = FolderReport {
            total: 4,
            processed: 2,
            indexed: 2,
            cancelled: true,
            ..Default::default()
        };
        let status = final_status(&JobId::from("j2"), Ok(Ok(report.clone())));
        assert_eq!(status, JobStatus::Cancelled { report: Some(report) });
    }
}
