//! Bounded queue between connection handlers and the store.
//!
//! Handlers enqueue writes and move on; a single task applies them in order.
//! [`HistoryWriter::flush`] waits until everything enqueued before it has been
//! applied.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::{NewCommand, SessionUpdate, Store};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug)]
enum HistoryOp {
    Command(NewCommand),
    Directory { session_id: String, cwd: String },
    Flush(oneshot::Sender<()>),
}

/// Cloneable sender side of the persistence queue.
#[derive(Debug, Clone)]
pub struct HistoryWriter {
    tx: mpsc::Sender<HistoryOp>,
}

impl HistoryWriter {
    /// Start the persistence task. It exits once every writer is dropped.
    pub fn spawn(store: Arc<dyn Store>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run(store, rx));
        (Self { tx }, task)
    }

    /// Queue a command record.
    pub async fn record(&self, command: NewCommand) {
        self.send(HistoryOp::Command(command)).await;
    }

    /// Queue a working-directory update for the stored session record.
    pub async fn directory_changed(&self, session_id: &str, cwd: String) {
        self.send(HistoryOp::Directory {
            session_id: session_id.to_string(),
            cwd,
        })
        .await;
    }

    /// Wait until all previously queued writes have reached the store.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(HistoryOp::Flush(done_tx)).await;
        if done_rx.await.is_err() {
            warn!("History task gone before flush completed");
        }
    }

    async fn send(&self, op: HistoryOp) {
        if let Err(e) = self.tx.send(op).await {
            warn!(op = ?e.0, "History task stopped, dropping write");
        }
    }
}

async fn run(store: Arc<dyn Store>, mut rx: mpsc::Receiver<HistoryOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            HistoryOp::Command(command) => {
                let record = store.add_command(command).await;
                debug!(session_id = %record.session_id, exit_code = %record.exit_code, "Command recorded");
            }
            HistoryOp::Directory { session_id, cwd } => {
                let update = SessionUpdate {
                    current_directory: Some(cwd),
                    ..SessionUpdate::default()
                };
                if store.update_session(&session_id, update).await.is_none() {
                    debug!(%session_id, "No stored session to update");
                }
            }
            HistoryOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("History task finished");
}
