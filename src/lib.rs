pub mod adapters;
pub mod config;
pub mod domain;
pub mod infra;
pub mod services;

use {
    adapters::registry::AdapterFactory, config::WebhookSecrets,
    services::reconciliation::ReconciliationEngine, std::sync::Arc,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    /// Reads back statuses for providers whose signature does not cover them.
    pub adapters: Arc<dyn AdapterFactory>,
    pub webhook_secrets: Arc<WebhookSecrets>,
}
