use tokio::sync::mpsc;

use crate::cache::ContentCaches;
use crate::config::Config;
use crate::enrich::Orchestrator;
use crate::feed::DiscoveryState;
use crate::fetch::{ConcurrencyGate, FetchJob, NetworkTier, TaskManager};
use crate::media::MediaCache;
use crate::storage::Database;

/// Everything the HTTP handlers and the scheduler share.
///
/// Lives behind one `Arc`; the individual members carry their own interior
/// synchronisation, so holding the state never serialises anything.
pub struct AppState {
    pub db: Database,
    pub client: reqwest::Client,
    pub config: Config,
    pub caches: ContentCaches,
    pub task_manager: TaskManager,
    pub orchestrator: Orchestrator,
    pub discovery: DiscoveryState,
    pub media_cache: MediaCache,
    pub gate: ConcurrencyGate,
    /// Producer side of the fetch work channel; the scheduler and the
    /// refresh endpoint both feed it
    pub job_tx: mpsc::Sender<FetchJob>,
}

impl AppState {
    pub fn new(
        db: Database,
        client: reqwest::Client,
        config: Config,
        media_cache: MediaCache,
        job_tx: mpsc::Sender<FetchJob>,
    ) -> Self {
        Self {
            orchestrator: Orchestrator::new(db.clone(), client.clone()),
            caches: ContentCaches::new(),
            task_manager: TaskManager::default(),
            discovery: DiscoveryState::default(),
            gate: ConcurrencyGate::new(NetworkTier::Medium.max_concurrency()),
            db,
            client,
            config,
            media_cache,
            job_tx,
        }
    }
}
