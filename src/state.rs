//! Application state shared across the web handlers and the sync service.

use crate::data::RecordStore;
use crate::status::StatusTracker;
use crate::sync::Scheduler;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub tracker: Arc<StatusTracker>,
    pub store: Arc<dyn RecordStore>,
}

impl AppState {
    pub fn new(
        scheduler: Arc<Scheduler>,
        tracker: Arc<StatusTracker>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            scheduler,
            tracker,
            store,
        }
    }
}
