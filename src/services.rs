pub mod lifecycle;
pub mod notifier;
pub mod reconciliation;
pub mod sweep;
