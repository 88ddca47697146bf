use crate::api::ProviderRegistry;
use crate::session::SessionRegistry;
use crate::storage::StorageManager;
use std::sync::Arc;
use tokio::sync::Mutex;

// Core application state shared by every request handler
#[derive(Clone)] // Allow cloning for background tasks
pub struct AppState {
    // All store reads and writes go through this lock, so a read-modify-write
    // of the chat list never interleaves with another.
    pub storage: Arc<Mutex<StorageManager>>,
    pub providers: ProviderRegistry,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(storage_manager: StorageManager, providers: ProviderRegistry) -> Self {
        Self {
            storage: Arc::new(Mutex::new(storage_manager)),
            providers,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }
}
