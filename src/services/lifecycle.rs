use {
    super::reconciliation::{Evidence, ReconciliationEngine},
    crate::{
        adapters::{registry::AdapterFactory, retry::RetryPolicy},
        domain::{
            audit::{AttemptOutcome, AttemptSource, ReconciliationAttempt, ReviewItem, ReviewReason},
            charge::{Charge, ChargeStatus, CreateChargeRequest, NewCharge},
            provider::{ChargeDetails, IssuedCharge},
            error::ChargeError,
            id::{Actor, ChargeId},
            payable::{NewPayableAccount, PayableAccount},
        },
        infra::store::{DraftClaim, IssueRecord, Store},
    },
    backon::{ExponentialBuilder, Retryable},
    chrono::{TimeDelta, Utc},
    serde_json::json,
    std::{sync::Arc, time::Duration},
};

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    /// Days after the period end the charge falls due.
    pub due_days: u64,
    /// Budget for the provider `issue_charge` call.
    pub issue_retry: RetryPolicy,
    /// Budget for persisting an issued charge; the provider is not called again.
    pub persist_attempts: usize,
    /// How long one caller may hold a draft while issuing it.
    pub issue_lease: TimeDelta,
    /// Pause between checks while another caller holds the draft.
    pub claim_wait: Duration,
    /// Give up waiting on another caller's lease after this long.
    pub claim_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            due_days: 10,
            issue_retry: RetryPolicy::default(),
            persist_attempts: 3,
            issue_lease: TimeDelta::minutes(2),
            claim_wait: Duration::from_millis(200),
            claim_timeout: Duration::from_secs(30),
        }
    }
}

/// A charge together with its payable account, once issued.
#[derive(Debug, Clone)]
pub struct ChargeView {
    pub charge: Charge,
    pub payable: Option<PayableAccount>,
}

pub struct ChargeLifecycleManager {
    engine: Arc<ReconciliationEngine>,
    adapters: Arc<dyn AdapterFactory>,
    settings: LifecycleSettings,
}

impl ChargeLifecycleManager {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        adapters: Arc<dyn AdapterFactory>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            engine,
            adapters,
            settings,
        }
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.engine.store()
    }

    async fn view(&self, charge: Charge) -> Result<ChargeView, ChargeError> {
        let payable = self.store().payable_for_charge(charge.id()).await?;
        Ok(ChargeView { charge, payable })
    }

    /// Issues the royalty charge for one establishment and period.
    ///
    /// Calling it again with the same inputs returns the charge already
    /// issued for them; a draft left behind by a failed attempt is reused
    /// under the same idempotency key.
    #[tracing::instrument(
        name = "create_charge",
        skip_all,
        fields(
            establishment_id = request.establishment_id,
            provider = %request.provider_type,
            actor = %actor,
        )
    )]
    pub async fn create(
        &self,
        actor: &Actor,
        request: CreateChargeRequest,
    ) -> Result<ChargeView, ChargeError> {
        let validated = request.validate()?;
        let credential = self
            .store()
            .active_credential(validated.establishment_id, validated.provider_type)
            .await?;
        let draft = NewCharge::draft(&validated, self.settings.due_days, actor)?;

        if let Some(existing) = self.store().charge_for_key(&draft.idempotency_key).await? {
            if existing.status() != ChargeStatus::Draft {
                tracing::info!(charge_id = %existing.id(), status = %existing.status(), "charge already issued for key");
                return self.view(existing).await;
            }
        }

        let charge = self.store().insert_draft(&draft).await?.into_charge();
        if charge.status() != ChargeStatus::Draft {
            return self.view(charge).await;
        }
        charge.verify_fee()?;

        let (charge, possibly_issued) = match self.claim(charge.id()).await? {
            DraftClaim::Claimed { charge, possibly_issued } => (charge, possibly_issued),
            DraftClaim::Settled(charge) => return self.view(charge).await,
            DraftClaim::Held { .. } => {
                return Err(ChargeError::Transient(format!(
                    "charge {} is being issued by another request",
                    charge.id()
                )));
            }
        };

        let adapter = self.adapters.adapter_for(&credential).await;
        let adapter = match adapter {
            Ok(adapter) => adapter,
            Err(e) => {
                self.store().release_draft(charge.id(), charge.version()).await?;
                return Err(e);
            }
        };
        let mut first = charge.details(&validated.payer);
        first.possibly_issued = possibly_issued;
        let again = ChargeDetails {
            possibly_issued: true,
            ..first.clone()
        };
        let key = charge.idempotency_key().clone();
        let mut calls = 0usize;
        let issued = self
            .settings
            .issue_retry
            .run("issue_charge", || {
                calls += 1;
                let details = if calls == 1 { &first } else { &again };
                adapter.issue_charge(details, &key)
            })
            .await;

        let issued = match issued {
            Ok(issued) => issued,
            Err(ChargeError::TerminalProvider(msg)) => {
                self.reject(&charge, actor, &msg).await?;
                return Err(ChargeError::TerminalProvider(msg));
            }
            Err(e) => {
                tracing::warn!(charge_id = %charge.id(), error = %e, "issue failed, draft kept for retry");
                self.store().release_draft(charge.id(), charge.version()).await?;
                return Err(e);
            }
        };

        let charge = self.persist_issue(&charge, actor, issued).await?;
        tracing::info!(
            charge_id = %charge.id(),
            reference = ?charge.provider_reference().map(|r| r.as_str()),
            fee_amount = %charge.fee_amount(),
            "charge issued"
        );
        self.engine
            .announce(&charge, ChargeStatus::Draft, ChargeStatus::Submitted);
        self.view(charge).await
    }

    /// Waits out another caller's lease, bounded by `claim_timeout`. An
    /// expired lease is taken over.
    async fn claim(&self, charge_id: ChargeId) -> Result<DraftClaim, ChargeError> {
        let started = tokio::time::Instant::now();
        loop {
            let now = Utc::now();
            let claim = self
                .store()
                .claim_draft(charge_id, now, now + self.settings.issue_lease)
                .await?;
            match claim {
                DraftClaim::Held { until } if started.elapsed() < self.settings.claim_timeout => {
                    tracing::debug!(charge_id = %charge_id, %until, "draft held by another request, waiting");
                    tokio::time::sleep(self.settings.claim_wait).await;
                }
                claim => return Ok(claim),
            }
        }
    }

    async fn reject(&self, charge: &Charge, actor: &Actor, msg: &str) -> Result<(), ChargeError> {
        let now = Utc::now();
        let detail = json!({ "stage": "issue", "error": msg });
        let attempt = ReconciliationAttempt::new(
            charge.id(),
            AttemptSource::Issue,
            actor,
            AttemptOutcome::Rejected,
            ChargeStatus::Draft,
            now,
        )
        .to(ChargeStatus::Rejected)
        .detail(detail.clone());
        let review = ReviewItem::open(charge.id(), ReviewReason::TerminalProviderError, detail, now);

        let rejected = self.store().reject_draft(charge.id(), &attempt, &review).await?;
        tracing::warn!(charge_id = %charge.id(), error = msg, "provider refused charge, marked rejected");
        self.engine
            .announce(&rejected, ChargeStatus::Draft, ChargeStatus::Rejected);
        Ok(())
    }

    /// Stores the provider's answer. Database failures are retried against
    /// the same draft; the provider call is never repeated here.
    async fn persist_issue(
        &self,
        charge: &Charge,
        actor: &Actor,
        issued: IssuedCharge,
    ) -> Result<Charge, ChargeError> {
        let now = Utc::now();
        let record = IssueRecord {
            charge_id: charge.id(),
            payable: NewPayableAccount::for_charge(charge),
            next_poll_at: now + self.engine.settings().poll_interval,
            attempt: ReconciliationAttempt::new(
                charge.id(),
                AttemptSource::Issue,
                actor,
                AttemptOutcome::Applied,
                ChargeStatus::Draft,
                now,
            )
            .to(ChargeStatus::Submitted)
            .detail(json!({ "reference": issued.reference.as_str() })),
            issued,
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_times(self.settings.persist_attempts.saturating_sub(1));
        let result = (|| self.store().finalize_issue(&record))
            .retry(backoff)
            .when(|e| matches!(e, ChargeError::Database(_)))
            .notify(|err: &ChargeError, delay: Duration| {
                tracing::warn!(charge_id = %record.charge_id, error = %err, ?delay, "persisting issued charge failed, retrying");
            })
            .await;

        if let Err(ChargeError::Invariant(msg)) = &result {
            tracing::error!(charge_id = %charge.id(), "{msg}");
        }
        result
    }

    pub async fn get(&self, charge_id: ChargeId) -> Result<ChargeView, ChargeError> {
        let charge = self
            .store()
            .get_charge(charge_id)
            .await?
            .ok_or_else(|| ChargeError::NotFound(format!("charge {charge_id}")))?;
        self.view(charge).await
    }

    /// Administrative cancel. The provider is asked first; providers that
    /// cannot cancel leave it to the local transition.
    pub async fn cancel(&self, actor: &Actor, charge_id: ChargeId) -> Result<ChargeView, ChargeError> {
        let view = self.get(charge_id).await?;
        let charge = &view.charge;
        if charge.status().is_terminal() {
            return Err(ChargeError::Validation(format!(
                "charge {charge_id} is already {}",
                charge.status()
            )));
        }

        if let Some(reference) = charge.provider_reference() {
            let credential = self
                .store()
                .active_credential(charge.establishment_id(), charge.provider_type())
                .await?;
            let adapter = self.adapters.adapter_for(&credential).await?;
            match adapter.cancel(reference).await {
                Ok(()) => {}
                Err(ChargeError::Unsupported(msg)) => {
                    tracing::info!(charge_id = %charge_id, "{msg}; canceling locally only");
                }
                Err(e) => return Err(e),
            }
        }

        let result = self
            .engine
            .apply_status(charge_id, ChargeStatus::Canceled, Evidence::manual(actor, Utc::now()))
            .await?;
        tracing::info!(charge_id = %charge_id, actor = %actor, result = result.as_str(), "cancel requested");
        self.get(charge_id).await
    }

    /// Clears the stalled flag and schedules an immediate poll.
    pub async fn resume_polling(&self, actor: &Actor, charge_id: ChargeId) -> Result<Charge, ChargeError> {
        let charge = self
            .store()
            .get_charge(charge_id)
            .await?
            .ok_or_else(|| ChargeError::NotFound(format!("charge {charge_id}")))?;
        let now = Utc::now();
        let attempt = ReconciliationAttempt::new(
            charge_id,
            AttemptSource::Manual,
            actor,
            AttemptOutcome::Resumed,
            charge.status(),
            now,
        )
        .detail(json!({ "previous_attempts": charge.attempts_count() }))
        .next_attempt(Some(now));

        let resumed = self.store().resume_polling(charge_id, now, &attempt).await?;
        tracing::info!(charge_id = %charge_id, actor = %actor, "polling resumed");
        Ok(resumed)
    }
}
