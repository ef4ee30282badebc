//! Bounded background analysis pool.
//!
//! Uploads submitted with "process immediately" are handed to
//! [`AnalysisWorkers`]: a bounded `mpsc` queue drained by a fixed number of
//! worker tasks. A queue slot is reserved before the document is claimed
//! (status `processing`), so a full queue never strands a document in
//! `processing` without a job behind it.
//!
//! Shutdown closes the queue and lets the workers drain it. Once the grace
//! period runs out, running analyses are cancelled and the workers stop
//! dequeuing. Documents still queued at that point stay `processing`;
//! [`AnalysisWorkers::shutdown`] logs and returns their ids.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::models::{Document, DocumentStatus};
use crate::service::{DocumentService, ServiceError};

/// Result of [`AnalysisWorkers::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The document was claimed and queued.
    Queued,
    /// The queue had no free slot; the document was left untouched.
    QueueFull,
    /// The document could not be claimed (already claimed or analyzed).
    NotClaimed,
    /// The pool is shutting down.
    Closed,
}

pub struct AnalysisWorkers {
    service: Arc<DocumentService>,
    sender: std::sync::Mutex<Option<mpsc::Sender<Uuid>>>,
    queue: Arc<AsyncMutex<mpsc::Receiver<Uuid>>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl AnalysisWorkers {
    /// Spawn `config.concurrency` workers on the current runtime.
    pub fn start(service: Arc<DocumentService>, config: &WorkerConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Uuid>(config.queue_capacity.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        let cancel = CancellationToken::new();

        let handles = (0..config.concurrency.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    rx.clone(),
                    service.clone(),
                    cancel.child_token(),
                ))
            })
            .collect();

        tracing::info!(
            workers = config.concurrency,
            queue_capacity = config.queue_capacity,
            "analysis workers started"
        );

        Arc::new(Self {
            service,
            sender: std::sync::Mutex::new(Some(tx)),
            queue: rx,
            handles: std::sync::Mutex::new(handles),
            cancel,
        })
    }

    /// Claim `doc` for background analysis and enqueue it.
    ///
    /// Returns the document as it stands afterwards (status `processing` when
    /// queued, unchanged otherwise) along with what happened. Never fails the
    /// caller; every non-queued outcome is logged.
    pub async fn submit(&self, doc: Document) -> (Document, Submission) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            tracing::warn!(id = %doc.id, "analysis workers closed; not queuing");
            return (doc, Submission::Closed);
        };

        let permit = match sender.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                tracing::warn!(id = %doc.id, "analysis queue full; document left uploaded");
                return (doc, Submission::QueueFull);
            }
            Err(TrySendError::Closed(())) => {
                tracing::warn!(id = %doc.id, "analysis workers closed; not queuing");
                return (doc, Submission::Closed);
            }
        };

        match self
            .service
            .update_status(doc.id, DocumentStatus::Processing)
            .await
        {
            Ok(claimed) => {
                permit.send(claimed.id);
                tracing::info!(id = %claimed.id, "queued background analysis");
                (claimed, Submission::Queued)
            }
            Err(e) => {
                tracing::warn!(id = %doc.id, error = %e, "could not claim document for analysis");
                (doc, Submission::NotClaimed)
            }
        }
    }

    /// Stop accepting jobs and wait for queued work to drain.
    ///
    /// Jobs still running after `grace` are cancelled and no further jobs are
    /// started. Returns the ids that were claimed but never analyzed.
    pub async fn shutdown(&self, grace: Duration) -> Vec<Uuid> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );

        let join_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "analysis worker panicked");
                }
            }
        };
        tokio::pin!(join_all);

        if tokio::time::timeout(grace, &mut join_all).await.is_err() {
            tracing::warn!("analysis workers still busy after grace period; cancelling");
            self.cancel.cancel();
            join_all.await;
        }

        let mut stranded = Vec::new();
        let mut queue = self.queue.lock().await;
        while let Ok(id) = queue.try_recv() {
            tracing::warn!(id = %id, "shutdown before queued analysis ran; document left processing");
            stranded.push(id);
        }
        tracing::info!(stranded = stranded.len(), "analysis workers stopped");
        stranded
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<Uuid>>>,
    service: Arc<DocumentService>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = async { rx.lock().await.recv().await } => next,
        };
        let Some(id) = next else { break };

        match service.analyze_claimed(id, &cancel).await {
            Ok(doc) => {
                tracing::info!(worker, id = %id, doc_type = %doc.doc_type, "background analysis finished")
            }
            Err(ServiceError::Cancelled) => {
                tracing::warn!(worker, id = %id, "background analysis cancelled; document left processing")
            }
            Err(e) => tracing::error!(worker, id = %id, error = %e, "background analysis failed"),
        }
    }
    tracing::debug!(worker, "analysis worker exiting");
}
