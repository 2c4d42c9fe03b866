//! Shared state for the HTTP handlers

use std::sync::Arc;

use crate::{metrics::Metrics, service::RecordService};

/// The shared app state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Publishes and resolves records
    pub service: RecordService,
    /// Relay metrics
    pub metrics: Arc<Metrics>,
}
