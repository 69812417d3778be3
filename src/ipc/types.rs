use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;
use tokio::runtime::Runtime;

use crate::composer::AssignmentLocks;
use crate::config::Config;
use crate::sync::ScoreSyncDispatcher;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Settings from the environment; workspace overrides are layered on top.
    pub base_config: Config,
    /// Effective settings for the open workspace.
    pub config: Config,
    pub locks: AssignmentLocks,
    pub dispatcher: ScoreSyncDispatcher,
    // Declared last so the dispatcher drops before the runtime it spawns on.
    _runtime: Runtime,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("assignd-sync")
            .enable_all()
            .build()?;
        let dispatcher = ScoreSyncDispatcher::with_http(runtime.handle().clone(), config.sync.clone())?;
        Ok(Self {
            workspace: None,
            db: None,
            base_config: config.clone(),
            config,
            locks: AssignmentLocks::default(),
            dispatcher,
            _runtime: runtime,
        })
    }
}
