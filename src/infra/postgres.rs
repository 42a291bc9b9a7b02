pub mod audit_repo;
pub mod charge_repo;
pub mod credential_repo;
pub mod event_repo;
mod rows;

use {
    super::store::{
        ChargeRepository, CommitOutcome, CredentialStore, DraftClaim, DraftOutcome, IdempotencyLedger,
        IssueRecord, PollFailure, ReconciliationCommit,
    },
    crate::domain::{
        audit::{NewWebhookEvent, ReconciliationAttempt, ReviewItem},
        charge::{Charge, NewCharge},
        credential::{GatewayCredential, NewGatewayCredential},
        error::ChargeError,
        id::{ChargeId, EstablishmentId, EventId, IdempotencyKey, ProviderReference},
        payable::PayableAccount,
        provider::ProviderType,
    },
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    sqlx::PgPool,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ChargeRepository for PgStore {
    async fn get_charge(&self, id: ChargeId) -> Result<Option<Charge>, ChargeError> {
        charge_repo::get(&self.pool, id).await
    }

    async fn find_by_reference(
        &self,
        provider: ProviderType,
        reference: &ProviderReference,
    ) -> Result<Option<Charge>, ChargeError> {
        charge_repo::find_by_reference(&self.pool, provider, reference).await
    }

    async fn insert_draft(&self, charge: &NewCharge) -> Result<DraftOutcome, ChargeError> {
        charge_repo::insert_draft(&self.pool, charge).await
    }

    async fn claim_draft(
        &self,
        charge_id: ChargeId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<DraftClaim, ChargeError> {
        charge_repo::claim_draft(&self.pool, charge_id, now, lease_until).await
    }

    async fn release_draft(&self, charge_id: ChargeId, version: i64) -> Result<(), ChargeError> {
        charge_repo::release_draft(&self.pool, charge_id, version).await
    }

    async fn finalize_issue(&self, record: &IssueRecord) -> Result<Charge, ChargeError> {
        charge_repo::finalize_issue(&self.pool, record).await
    }

    async fn reject_draft(
        &self,
        charge_id: ChargeId,
        attempt: &ReconciliationAttempt,
        review: &ReviewItem,
    ) -> Result<Charge, ChargeError> {
        charge_repo::reject_draft(&self.pool, charge_id, attempt, review).await
    }

    async fn commit_reconciliation(
        &self,
        commit: &ReconciliationCommit,
    ) -> Result<CommitOutcome, ChargeError> {
        charge_repo::commit_reconciliation(&self.pool, commit).await
    }

    async fn record_poll_failure(&self, failure: &PollFailure) -> Result<bool, ChargeError> {
        charge_repo::record_poll_failure(&self.pool, failure).await
    }

    async fn due_for_poll(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Charge>, ChargeError> {
        charge_repo::due_for_poll(&self.pool, now, limit).await
    }

    async fn resume_polling(
        &self,
        charge_id: ChargeId,
        next_poll_at: DateTime<Utc>,
        attempt: &ReconciliationAttempt,
    ) -> Result<Charge, ChargeError> {
        charge_repo::resume_polling(&self.pool, charge_id, next_poll_at, attempt).await
    }

    async fn payable_for_charge(
        &self,
        charge_id: ChargeId,
    ) -> Result<Option<PayableAccount>, ChargeError> {
        charge_repo::payable_for_charge(&self.pool, charge_id).await
    }

    async fn attempts_for_charge(
        &self,
        charge_id: ChargeId,
    ) -> Result<Vec<ReconciliationAttempt>, ChargeError> {
        audit_repo::attempts_for_charge(&self.pool, charge_id).await
    }

    async fn open_review_items(&self) -> Result<Vec<ReviewItem>, ChargeError> {
        audit_repo::open_review_items(&self.pool).await
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn active_credential(
        &self,
        establishment: EstablishmentId,
        provider: ProviderType,
    ) -> Result<GatewayCredential, ChargeError> {
        credential_repo::active(&self.pool, establishment, provider).await
    }

    async fn activate_credential(
        &self,
        credential: NewGatewayCredential,
    ) -> Result<GatewayCredential, ChargeError> {
        credential_repo::activate(&self.pool, credential).await
    }

    async fn active_credential_count(&self) -> Result<i64, ChargeError> {
        credential_repo::active_count(&self.pool).await
    }
}

#[async_trait]
impl IdempotencyLedger for PgStore {
    async fn event_seen(&self, event_id: &EventId) -> Result<bool, ChargeError> {
        event_repo::event_seen(&self.pool, event_id).await
    }

    async fn record_unmatched_event(&self, event: &NewWebhookEvent) -> Result<bool, ChargeError> {
        event_repo::record_unmatched(&self.pool, event).await
    }

    async fn charge_for_key(&self, key: &IdempotencyKey) -> Result<Option<Charge>, ChargeError> {
        charge_repo::find_by_key(&self.pool, key).await
    }
}
