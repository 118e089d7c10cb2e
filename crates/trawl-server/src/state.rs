use trawl_core::{MemoryCache, MemoryContentStore, Orchestrator};

/// Orchestrator flavour used by the server: in-memory cache and content index.
pub type ServerOrchestrator = Orchestrator<MemoryCache, MemoryContentStore>;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub orchestrator: ServerOrchestrator,
    /// Bearer token required on `/v1/*` and `/ws*`.
    pub api_key: String,
}
