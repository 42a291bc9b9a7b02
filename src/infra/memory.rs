//! In-process store used by the test suites. One lock guards
//! everything, so each trait method is trivially atomic.

use {
    super::store::{
        ChargeRepository, CommitOutcome, CredentialStore, DraftClaim, DraftOutcome, IdempotencyLedger,
        IssueRecord, PollFailure, ReconciliationCommit,
    },
    crate::domain::{
        audit::{NewWebhookEvent, ReconciliationAttempt, ReviewItem, WebhookEventRecord},
        charge::{Charge, ChargeStatus, NewCharge},
        credential::{GatewayCredential, NewGatewayCredential},
        error::ChargeError,
        id::{ChargeId, EstablishmentId, EventId, IdempotencyKey, ProviderReference},
        payable::PayableAccount,
        provider::ProviderType,
    },
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    std::collections::HashMap,
    tokio::sync::Mutex,
};

#[derive(Default)]
struct Inner {
    charges: HashMap<ChargeId, Charge>,
    keys: HashMap<IdempotencyKey, ChargeId>,
    payables: HashMap<ChargeId, PayableAccount>,
    events: HashMap<EventId, WebhookEventRecord>,
    attempts: Vec<ReconciliationAttempt>,
    reviews: Vec<ReviewItem>,
    credentials: Vec<GatewayCredential>,
}

impl Inner {
    fn charge_mut(&mut self, id: ChargeId) -> Result<&mut Charge, ChargeError> {
        self.charges
            .get_mut(&id)
            .ok_or_else(|| ChargeError::NotFound(format!("charge {id}")))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn charges(&self) -> Vec<Charge> {
        let inner = self.inner.lock().await;
        let mut charges: Vec<Charge> = inner.charges.values().cloned().collect();
        charges.sort_by_key(|c| c.created_at());
        charges
    }

    pub async fn payables(&self) -> Vec<PayableAccount> {
        self.inner.lock().await.payables.values().cloned().collect()
    }

    pub async fn webhook_event(&self, event_id: &EventId) -> Option<WebhookEventRecord> {
        self.inner.lock().await.events.get(event_id).cloned()
    }

    pub async fn webhook_event_count(&self) -> usize {
        self.inner.lock().await.events.len()
    }
}

#[async_trait]
impl ChargeRepository for MemoryStore {
    async fn get_charge(&self, id: ChargeId) -> Result<Option<Charge>, ChargeError> {
        Ok(self.inner.lock().await.charges.get(&id).cloned())
    }

    async fn find_by_reference(
        &self,
        provider: ProviderType,
        reference: &ProviderReference,
    ) -> Result<Option<Charge>, ChargeError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .charges
            .values()
            .find(|c| c.provider_type == provider && c.provider_reference.as_ref() == Some(reference))
            .cloned())
    }

    async fn insert_draft(&self, charge: &NewCharge) -> Result<DraftOutcome, ChargeError> {
        let mut inner = self.inner.lock().await;
        if let Some(id) = inner.keys.get(&charge.idempotency_key) {
            let existing = inner.charges.get(id).cloned().ok_or_else(|| {
                ChargeError::Invariant(format!("idempotency key {} has no charge", charge.idempotency_key))
            })?;
            return Ok(DraftOutcome::Existing(existing));
        }
        let draft = Charge::from_draft(charge, Utc::now());
        inner.keys.insert(charge.idempotency_key.clone(), draft.id());
        inner.charges.insert(draft.id(), draft.clone());
        Ok(DraftOutcome::Inserted(draft))
    }

    async fn claim_draft(
        &self,
        charge_id: ChargeId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<DraftClaim, ChargeError> {
        let mut inner = self.inner.lock().await;
        Ok(DraftClaim::take(inner.charge_mut(charge_id)?, now, lease_until))
    }

    async fn release_draft(&self, charge_id: ChargeId, version: i64) -> Result<(), ChargeError> {
        let mut inner = self.inner.lock().await;
        let charge = inner.charge_mut(charge_id)?;
        if charge.status == ChargeStatus::Draft && charge.version == version {
            charge.issue_lease_until = None;
        }
        Ok(())
    }

    async fn finalize_issue(&self, record: &IssueRecord) -> Result<Charge, ChargeError> {
        let mut inner = self.inner.lock().await;
        let reference = &record.issued.reference;

        let taken = inner.charges.values().any(|c| {
            c.id != record.charge_id
                && c.provider_reference.as_ref() == Some(reference)
                && inner
                    .charges
                    .get(&record.charge_id)
                    .is_some_and(|own| own.provider_type == c.provider_type)
        });
        if taken {
            return Err(ChargeError::Invariant(format!(
                "provider reference {reference} already belongs to another charge"
            )));
        }

        let now = record.attempt.attempted_at;
        let charge = inner.charge_mut(record.charge_id)?;
        if !record.apply_to(charge)? {
            return Ok(charge.clone());
        }
        let updated = charge.clone();

        inner
            .payables
            .entry(record.charge_id)
            .or_insert_with(|| PayableAccount {
                id: record.payable.id,
                establishment_id: record.payable.establishment_id,
                charge_id: record.payable.charge_id,
                amount: record.payable.amount,
                due_date: record.payable.due_date,
                status: ChargeStatus::Submitted,
                paid_at: None,
                created_at: now,
                updated_at: now,
            });
        inner.attempts.push(record.attempt.clone());
        Ok(updated)
    }

    async fn reject_draft(
        &self,
        charge_id: ChargeId,
        attempt: &ReconciliationAttempt,
        review: &ReviewItem,
    ) -> Result<Charge, ChargeError> {
        let mut inner = self.inner.lock().await;
        let charge = inner.charge_mut(charge_id)?;
        if charge.status != ChargeStatus::Draft {
            return Err(ChargeError::Invariant(format!(
                "charge {charge_id} is {}, only drafts can be rejected",
                charge.status
            )));
        }
        charge.status = ChargeStatus::Rejected;
        charge.next_poll_at = None;
        charge.issue_lease_until = None;
        charge.version += 1;
        charge.updated_at = attempt.attempted_at;
        let updated = charge.clone();
        inner.attempts.push(attempt.clone());
        inner.reviews.push(review.clone());
        Ok(updated)
    }

    async fn commit_reconciliation(
        &self,
        commit: &ReconciliationCommit,
    ) -> Result<CommitOutcome, ChargeError> {
        let mut inner = self.inner.lock().await;

        let current_version = inner.charge_mut(commit.charge_id)?.version;
        if current_version != commit.expected_version {
            return Ok(CommitOutcome::VersionConflict);
        }
        if let Some(event) = &commit.event {
            if inner.events.contains_key(&event.external_event_id) {
                return Ok(CommitOutcome::DuplicateEvent);
            }
        }

        let now = commit.attempt.attempted_at;
        let charge = inner.charge_mut(commit.charge_id)?;
        commit.apply_to(charge);
        let updated = charge.clone();

        if let Some(change) = &commit.change {
            if let Some(payable) = inner.payables.get_mut(&commit.charge_id) {
                payable.status = change.to;
                if change.to == ChargeStatus::Paid {
                    payable.paid_at = change.paid_at;
                }
                payable.updated_at = now;
            }
        }

        if let Some(event) = &commit.event {
            inner.events.insert(
                event.external_event_id.clone(),
                WebhookEventRecord {
                    external_event_id: event.external_event_id.clone(),
                    provider_type: event.provider_type,
                    charge_id: Some(commit.charge_id),
                    raw_payload: event.raw_payload.clone(),
                    outcome: commit.event_outcome().to_string(),
                    received_at: event.received_at,
                    applied_at: commit.applied_at(),
                },
            );
        }
        inner.attempts.push(commit.attempt.clone());
        if let Some(review) = &commit.review {
            inner.reviews.push(review.clone());
        }
        Ok(CommitOutcome::Committed(updated))
    }

    async fn record_poll_failure(&self, failure: &PollFailure) -> Result<bool, ChargeError> {
        let mut inner = self.inner.lock().await;
        let charge = inner.charge_mut(failure.charge_id)?;
        if !failure.still_applies(charge) {
            return Ok(false);
        }
        failure.apply_to(charge);
        inner.attempts.push(failure.attempt.clone());
        if let Some(review) = &failure.review {
            inner.reviews.push(review.clone());
        }
        Ok(true)
    }

    async fn due_for_poll(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Charge>, ChargeError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<Charge> = inner
            .charges
            .values()
            .filter(|c| {
                c.is_issued()
                    && !c.stalled
                    && !c.status.is_terminal()
                    && c.status != ChargeStatus::Draft
                    && c.next_poll_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|c| c.next_poll_at);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn resume_polling(
        &self,
        charge_id: ChargeId,
        next_poll_at: DateTime<Utc>,
        attempt: &ReconciliationAttempt,
    ) -> Result<Charge, ChargeError> {
        let mut inner = self.inner.lock().await;
        let charge = inner.charge_mut(charge_id)?;
        if charge.status.is_terminal() {
            return Err(ChargeError::Validation(format!(
                "charge {charge_id} is {}, nothing to poll",
                charge.status
            )));
        }
        charge.stalled = false;
        charge.attempts_count = 0;
        charge.next_poll_at = Some(next_poll_at);
        charge.updated_at = attempt.attempted_at;
        let updated = charge.clone();
        inner.attempts.push(attempt.clone());
        Ok(updated)
    }

    async fn payable_for_charge(
        &self,
        charge_id: ChargeId,
    ) -> Result<Option<PayableAccount>, ChargeError> {
        Ok(self.inner.lock().await.payables.get(&charge_id).cloned())
    }

    async fn attempts_for_charge(
        &self,
        charge_id: ChargeId,
    ) -> Result<Vec<ReconciliationAttempt>, ChargeError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attempts
            .iter()
            .filter(|a| a.charge_id == charge_id)
            .cloned()
            .collect())
    }

    async fn open_review_items(&self) -> Result<Vec<ReviewItem>, ChargeError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .reviews
            .iter()
            .filter(|r| r.resolved_at.is_none())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn active_credential(
        &self,
        establishment: EstablishmentId,
        provider: ProviderType,
    ) -> Result<GatewayCredential, ChargeError> {
        let inner = self.inner.lock().await;
        let credential = inner
            .credentials
            .iter()
            .find(|c| c.active && c.establishment_id == establishment && c.provider_type == provider)
            .cloned()
            .ok_or_else(|| {
                ChargeError::Configuration(format!(
                    "no active {provider} credential for establishment {establishment}"
                ))
            })?;
        credential.ensure_usable(Utc::now())?;
        Ok(credential)
    }

    async fn activate_credential(
        &self,
        credential: NewGatewayCredential,
    ) -> Result<GatewayCredential, ChargeError> {
        let mut inner = self.inner.lock().await;
        for existing in inner.credentials.iter_mut().filter(|c| {
            c.establishment_id == credential.establishment_id
                && c.provider_type == credential.provider_type
        }) {
            existing.active = false;
        }
        let active = credential.into_active(Utc::now());
        inner.credentials.push(active.clone());
        Ok(active)
    }

    async fn active_credential_count(&self) -> Result<i64, ChargeError> {
        let inner = self.inner.lock().await;
        Ok(inner.credentials.iter().filter(|c| c.active).count() as i64)
    }
}

#[async_trait]
impl IdempotencyLedger for MemoryStore {
    async fn event_seen(&self, event_id: &EventId) -> Result<bool, ChargeError> {
        Ok(self.inner.lock().await.events.contains_key(event_id))
    }

    async fn record_unmatched_event(&self, event: &NewWebhookEvent) -> Result<bool, ChargeError> {
        let mut inner = self.inner.lock().await;
        if inner.events.contains_key(&event.external_event_id) {
            return Ok(false);
        }
        inner.events.insert(
            event.external_event_id.clone(),
            WebhookEventRecord {
                external_event_id: event.external_event_id.clone(),
                provider_type: event.provider_type,
                charge_id: None,
                raw_payload: event.raw_payload.clone(),
                outcome: "unmatched".to_string(),
                received_at: event.received_at,
                applied_at: None,
            },
        );
        Ok(true)
    }

    async fn charge_for_key(&self, key: &IdempotencyKey) -> Result<Option<Charge>, ChargeError> {
        let inner = self.inner.lock().await;
        Ok(inner.keys.get(key).and_then(|id| inner.charges.get(id)).cloned())
    }
}
