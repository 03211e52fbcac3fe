pub mod config;
pub mod error;
pub mod rooms;
pub mod store;

use std::sync::Arc;

use axum::extract::FromRef;

use crate::rooms::lobby::RoomLocks;
use crate::rooms::registry::ConnectionRegistry;
use crate::store::Store;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Store,
    pub registry: Arc<ConnectionRegistry>,
    pub locks: Arc<RoomLocks>,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            registry: Arc::new(ConnectionRegistry::new()),
            locks: Arc::new(RoomLocks::new()),
        }
    }
}
