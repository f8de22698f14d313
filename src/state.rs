//! Shared application state.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::executor::Executor;
use crate::history::HistoryWriter;
use crate::session::SessionRegistry;
use crate::store::{MemStore, Store};

/// Everything a request or connection handler needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<dyn Store>,
    pub executor: Arc<Executor>,
    pub history: HistoryWriter,
    pub history_limit: usize,
}

impl AppState {
    /// Build state over a fresh in-memory store. The returned handle is the
    /// persistence task; it finishes once every clone of the state is dropped.
    pub fn new(config: &ServerConfig) -> (Self, JoinHandle<()>) {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let (history, task) = HistoryWriter::spawn(store.clone(), config.queue_capacity);
        let state = Self {
            registry: Arc::new(SessionRegistry::new(
                config.sandbox_base.clone(),
                store.clone(),
            )),
            store,
            executor: Arc::new(Executor::new(config.exec.clone())),
            history,
            history_limit: config.history_limit,
        };
        (state, task)
    }
}
