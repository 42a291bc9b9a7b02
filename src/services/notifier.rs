use {
    crate::domain::{
        charge::{Charge, ChargeStatus},
        error::ChargeError,
    },
    async_trait::async_trait,
    std::sync::Arc,
};

/// Downstream collaborator told about every status change.
#[async_trait]
pub trait TransitionListener: Send + Sync {
    async fn on_charge_transition(
        &self,
        charge: &Charge,
        old: ChargeStatus,
        new: ChargeStatus,
    ) -> Result<(), ChargeError>;
}

/// Default listener: just a structured log line.
pub struct TracingListener;

#[async_trait]
impl TransitionListener for TracingListener {
    async fn on_charge_transition(
        &self,
        charge: &Charge,
        old: ChargeStatus,
        new: ChargeStatus,
    ) -> Result<(), ChargeError> {
        tracing::info!(
            charge_id = %charge.id(),
            establishment_id = %charge.establishment_id(),
            provider = %charge.provider_type(),
            from = %old,
            to = %new,
            "charge transitioned"
        );
        Ok(())
    }
}

/// Fire and forget. The transition is already committed; a failing
/// listener is logged and never rolls it back.
pub fn spawn_notification(
    listener: Arc<dyn TransitionListener>,
    charge: Charge,
    old: ChargeStatus,
    new: ChargeStatus,
) {
    tokio::spawn(async move {
        if let Err(e) = listener.on_charge_transition(&charge, old, new).await {
            tracing::warn!(charge_id = %charge.id(), error = %e, "transition listener failed");
        }
    });
}
