//! Storage seams. Each method is one atomic unit; implementations must not
//! expose partial effects of a failed call.

use {
    crate::domain::{
        audit::{AttemptOutcome, NewWebhookEvent, ReconciliationAttempt, ReviewItem},
        charge::{Charge, ChargeStatus, NewCharge},
        credential::{GatewayCredential, NewGatewayCredential},
        error::ChargeError,
        id::{ChargeId, EstablishmentId, EventId, IdempotencyKey, ProviderReference},
        money::Money,
        payable::{NewPayableAccount, PayableAccount},
        provider::{IssuedCharge, ProviderType},
    },
    async_trait::async_trait,
    chrono::{DateTime, Utc},
};

#[derive(Debug)]
pub enum DraftOutcome {
    Inserted(Charge),
    /// A charge with the same idempotency key already exists.
    Existing(Charge),
}

impl DraftOutcome {
    pub fn into_charge(self) -> Charge {
        match self {
            Self::Inserted(charge) | Self::Existing(charge) => charge,
        }
    }
}

/// Result of asking for the issuing lease on a draft.
#[derive(Debug)]
pub enum DraftClaim {
    /// The caller owns the lease and may call the provider. `possibly_issued`
    /// is set when an earlier lease existed, so a provider object may already
    /// be out there.
    Claimed { charge: Charge, possibly_issued: bool },
    /// Someone else is issuing it.
    Held { until: DateTime<Utc> },
    /// No longer a draft; nothing to issue.
    Settled(Charge),
}

impl DraftClaim {
    /// Lease check and take on a locked charge. The version bump makes the
    /// take visible to every other reader.
    pub(crate) fn take(charge: &mut Charge, now: DateTime<Utc>, lease_until: DateTime<Utc>) -> Self {
        if charge.status != ChargeStatus::Draft {
            return Self::Settled(charge.clone());
        }
        if let Some(until) = charge.issue_lease_until.filter(|until| *until > now) {
            return Self::Held { until };
        }
        let possibly_issued = charge.version > 0;
        charge.issue_lease_until = Some(lease_until);
        charge.version += 1;
        charge.updated_at = now;
        Self::Claimed {
            charge: charge.clone(),
            possibly_issued,
        }
    }
}

/// Persist the provider's answer for a draft together with its payable account.
#[derive(Debug, Clone)]
pub struct IssueRecord {
    pub charge_id: ChargeId,
    pub issued: IssuedCharge,
    pub payable: NewPayableAccount,
    pub next_poll_at: DateTime<Utc>,
    pub attempt: ReconciliationAttempt,
}

#[derive(Debug, Clone)]
pub struct StatusChange {
    pub to: ChargeStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_amount: Option<Money>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleUpdate {
    Keep,
    Set {
        attempts_count: i32,
        next_poll_at: Option<DateTime<Utc>>,
    },
}

/// Everything `apply_status` writes, committed together or not at all.
#[derive(Debug, Clone)]
pub struct ReconciliationCommit {
    pub charge_id: ChargeId,
    /// Optimistic concurrency: the version the decision was made against.
    pub expected_version: i64,
    pub change: Option<StatusChange>,
    pub schedule: ScheduleUpdate,
    /// Present on the webhook path. Inserting it is the dedup gate.
    pub event: Option<NewWebhookEvent>,
    pub attempt: ReconciliationAttempt,
    pub review: Option<ReviewItem>,
}

impl IssueRecord {
    /// Moves a draft to `submitted`. `Ok(false)` when the charge already
    /// carries this exact reference.
    pub(crate) fn apply_to(&self, charge: &mut Charge) -> Result<bool, ChargeError> {
        let reference = &self.issued.reference;
        match (&charge.provider_reference, charge.status) {
            (Some(existing), _) if existing == reference => return Ok(false),
            (Some(existing), _) => {
                return Err(ChargeError::Invariant(format!(
                    "charge {} already has reference {existing}, refusing {reference}",
                    charge.id
                )));
            }
            (None, ChargeStatus::Draft) => {}
            (None, status) => {
                return Err(ChargeError::Invariant(format!(
                    "charge {} is {status}, cannot record an issue",
                    charge.id
                )));
            }
        }
        charge.provider_reference = Some(reference.clone());
        charge.payment_instrument = Some(self.issued.instrument.clone());
        charge.status = ChargeStatus::Submitted;
        charge.issue_lease_until = None;
        charge.attempts_count = 0;
        charge.next_poll_at = Some(self.next_poll_at);
        charge.version += 1;
        charge.updated_at = self.attempt.attempted_at;
        Ok(true)
    }
}

impl ReconciliationCommit {
    pub(crate) fn apply_to(&self, charge: &mut Charge) {
        if let Some(change) = &self.change {
            charge.status = change.to;
            charge.issue_lease_until = None;
            if change.to == ChargeStatus::Paid {
                charge.paid_at = change.paid_at;
                charge.paid_amount = change.paid_amount;
            }
            charge.version += 1;
        }
        if let ScheduleUpdate::Set {
            attempts_count,
            next_poll_at,
        } = self.schedule
        {
            charge.attempts_count = attempts_count;
            charge.next_poll_at = next_poll_at;
        }
        charge.updated_at = self.attempt.attempted_at;
    }

    /// Ledger outcome stored next to the webhook event.
    pub(crate) fn event_outcome(&self) -> &'static str {
        self.attempt.outcome.as_str()
    }

    pub(crate) fn applied_at(&self) -> Option<DateTime<Utc>> {
        (self.attempt.outcome == AttemptOutcome::Applied).then_some(self.attempt.attempted_at)
    }
}

#[derive(Debug)]
pub enum CommitOutcome {
    Committed(Charge),
    DuplicateEvent,
    VersionConflict,
}

/// Poll bookkeeping after a failed fetch. Does not touch status or version.
#[derive(Debug, Clone)]
pub struct PollFailure {
    pub charge_id: ChargeId,
    /// Version of the snapshot the sweep fetched for. A webhook that moved
    /// the charge meanwhile makes this failure stale.
    pub expected_version: i64,
    pub attempts_count: i32,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub stalled: bool,
    pub attempt: ReconciliationAttempt,
    pub review: Option<ReviewItem>,
}

impl PollFailure {
    /// `false` once the charge has moved on since the sweep read it.
    pub(crate) fn still_applies(&self, charge: &Charge) -> bool {
        charge.version == self.expected_version && !charge.status.is_terminal()
    }

    pub(crate) fn apply_to(&self, charge: &mut Charge) {
        charge.attempts_count = self.attempts_count;
        charge.next_poll_at = self.next_poll_at;
        charge.stalled = self.stalled;
        charge.updated_at = self.attempt.attempted_at;
    }
}

#[async_trait]
pub trait ChargeRepository: Send + Sync {
    async fn get_charge(&self, id: ChargeId) -> Result<Option<Charge>, ChargeError>;

    async fn find_by_reference(
        &self,
        provider: ProviderType,
        reference: &ProviderReference,
    ) -> Result<Option<Charge>, ChargeError>;

    async fn insert_draft(&self, charge: &NewCharge) -> Result<DraftOutcome, ChargeError>;

    /// Takes the issuing lease on a draft so only one caller reaches the
    /// provider at a time. An expired lease can be taken over.
    async fn claim_draft(
        &self,
        charge_id: ChargeId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<DraftClaim, ChargeError>;

    /// Drops a lease taken at `version` after an issue attempt that created
    /// nothing locally. A lease taken over by someone else is left alone.
    async fn release_draft(&self, charge_id: ChargeId, version: i64) -> Result<(), ChargeError>;

    /// Draft → submitted, reference set once, payable account created.
    /// Re-finalizing with the same reference returns the stored charge;
    /// a different reference is an `Invariant` error.
    async fn finalize_issue(&self, record: &IssueRecord) -> Result<Charge, ChargeError>;

    /// Draft → rejected after an explicit provider refusal.
    async fn reject_draft(
        &self,
        charge_id: ChargeId,
        attempt: &ReconciliationAttempt,
        review: &ReviewItem,
    ) -> Result<Charge, ChargeError>;

    async fn commit_reconciliation(
        &self,
        commit: &ReconciliationCommit,
    ) -> Result<CommitOutcome, ChargeError>;

    /// Writes the failure unless the charge changed since it was read.
    /// `Ok(false)` means nothing was written.
    async fn record_poll_failure(&self, failure: &PollFailure) -> Result<bool, ChargeError>;

    /// Non-terminal, issued, not stalled, `next_poll_at <= now`; oldest first.
    async fn due_for_poll(&self, now: DateTime<Utc>, limit: i64)
    -> Result<Vec<Charge>, ChargeError>;

    async fn resume_polling(
        &self,
        charge_id: ChargeId,
        next_poll_at: DateTime<Utc>,
        attempt: &ReconciliationAttempt,
    ) -> Result<Charge, ChargeError>;

    async fn payable_for_charge(
        &self,
        charge_id: ChargeId,
    ) -> Result<Option<PayableAccount>, ChargeError>;

    async fn attempts_for_charge(
        &self,
        charge_id: ChargeId,
    ) -> Result<Vec<ReconciliationAttempt>, ChargeError>;

    async fn open_review_items(&self) -> Result<Vec<ReviewItem>, ChargeError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The single active credential for the pair. Missing, inactive or
    /// expired is a `Configuration` error.
    async fn active_credential(
        &self,
        establishment: EstablishmentId,
        provider: ProviderType,
    ) -> Result<GatewayCredential, ChargeError>;

    /// Stores a new active credential, deactivating the previous one atomically.
    async fn activate_credential(
        &self,
        credential: NewGatewayCredential,
    ) -> Result<GatewayCredential, ChargeError>;

    async fn active_credential_count(&self) -> Result<i64, ChargeError>;
}

#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn event_seen(&self, event_id: &EventId) -> Result<bool, ChargeError>;

    /// Records a delivery that matched no charge. `false` if already recorded.
    async fn record_unmatched_event(&self, event: &NewWebhookEvent) -> Result<bool, ChargeError>;

    async fn charge_for_key(&self, key: &IdempotencyKey) -> Result<Option<Charge>, ChargeError>;
}

pub trait Store: ChargeRepository + CredentialStore + IdempotencyLedger {}

impl<T> Store for T where T: ChargeRepository + CredentialStore + IdempotencyLedger {}
