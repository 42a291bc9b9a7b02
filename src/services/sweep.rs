use {
    super::reconciliation::{ApplyResult, Evidence, ReconciliationEngine},
    crate::{
        adapters::{circuit_breaker::ProviderBreakers, registry::AdapterFactory},
        domain::{
            audit::{AttemptOutcome, AttemptSource, ReconciliationAttempt, ReviewItem, ReviewReason},
            charge::Charge,
            error::ChargeError,
            id::{Actor, ProviderReference},
            provider::FetchedStatus,
            status_map::map_status,
        },
        infra::store::{PollFailure, Store},
    },
    chrono::{DateTime, TimeDelta, Utc},
    futures::{StreamExt, stream},
    serde_json::json,
    std::{sync::Arc, time::Duration},
    tokio::sync::watch,
};

#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub batch_size: i64,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub poll_base: TimeDelta,
    pub poll_cap: TimeDelta,
    /// Consecutive failures before a charge is stalled.
    pub max_attempts: i32,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            batch_size: 200,
            concurrency: 8,
            fetch_timeout: Duration::from_secs(30),
            poll_base: TimeDelta::seconds(60),
            poll_cap: TimeDelta::seconds(3600),
            max_attempts: 50,
        }
    }
}

/// `min(base * 2^attempts, cap)`; `attempts` is the count before this failure.
pub fn poll_backoff(attempts: i32, base: TimeDelta, cap: TimeDelta) -> TimeDelta {
    let exponent = u32::try_from(attempts).unwrap_or(0);
    2i32.checked_pow(exponent)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(cap, |delay| delay.min(cap))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub selected: usize,
    pub advanced: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub stalled: usize,
    /// Provider circuit open; not counted as attempts.
    pub skipped: usize,
}

enum PollOutcome {
    Applied(ApplyResult),
    Failed { stalled: bool },
    /// The fetch failed but the charge moved on meanwhile; nothing recorded.
    Superseded,
    Skipped,
}

pub struct Sweeper {
    engine: Arc<ReconciliationEngine>,
    adapters: Arc<dyn AdapterFactory>,
    breakers: ProviderBreakers,
    settings: SweepSettings,
}

impl Sweeper {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        adapters: Arc<dyn AdapterFactory>,
        breakers: ProviderBreakers,
        settings: SweepSettings,
    ) -> Self {
        Self {
            engine,
            adapters,
            breakers,
            settings,
        }
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.engine.store()
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, ChargeError> {
        self.sweep_at(Utc::now()).await
    }

    /// One pass over every charge due at `now`. Individual charge failures
    /// are rescheduled, not returned; only store-level failures are errors.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, ChargeError> {
        let due = self
            .store()
            .due_for_poll(now, self.settings.batch_size)
            .await?;
        let mut report = SweepReport {
            selected: due.len(),
            ..SweepReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<Result<PollOutcome, ChargeError>> = stream::iter(due)
            .map(|charge| self.poll_charge(charge, now))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(PollOutcome::Applied(ApplyResult::Advanced { .. })) => report.advanced += 1,
                Ok(PollOutcome::Applied(_) | PollOutcome::Superseded) => report.unchanged += 1,
                Ok(PollOutcome::Failed { stalled }) => {
                    report.failed += 1;
                    if stalled {
                        report.stalled += 1;
                    }
                }
                Ok(PollOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(error = %e, "poll bookkeeping failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            selected = report.selected,
            advanced = report.advanced,
            unchanged = report.unchanged,
            failed = report.failed,
            stalled = report.stalled,
            skipped = report.skipped,
            "sweep finished"
        );
        Ok(report)
    }

    async fn poll_charge(&self, charge: Charge, now: DateTime<Utc>) -> Result<PollOutcome, ChargeError> {
        let provider = charge.provider_type();
        let breaker = self.breakers.get(provider);
        if !breaker.allows(now) {
            tracing::debug!(charge_id = %charge.id(), provider = %provider, "circuit open, skipping");
            return Ok(PollOutcome::Skipped);
        }
        let Some(reference) = charge.provider_reference().cloned() else {
            return Ok(PollOutcome::Skipped);
        };

        match self.fetch(&charge, &reference).await {
            Ok(fetched) => {
                breaker.record_success();
                let target = map_status(provider, &fetched.native_status);
                let result = self
                    .engine
                    .apply_status(charge.id(), target, Evidence::poll(&fetched, now))
                    .await?;
                Ok(PollOutcome::Applied(result))
            }
            Err(e @ ChargeError::Transient(_)) => {
                breaker.record_failure(now);
                self.record_failure(&charge, &e, now, false).await
            }
            Err(e @ (ChargeError::Authentication(_) | ChargeError::Configuration(_))) => {
                self.record_failure(&charge, &e, now, false).await
            }
            Err(e @ ChargeError::TerminalProvider(_)) => {
                self.record_failure(&charge, &e, now, true).await
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch(
        &self,
        charge: &Charge,
        reference: &ProviderReference,
    ) -> Result<FetchedStatus, ChargeError> {
        let credential = self
            .store()
            .active_credential(charge.establishment_id(), charge.provider_type())
            .await?;
        let adapter = self.adapters.adapter_for(&credential).await?;
        tokio::time::timeout(self.settings.fetch_timeout, adapter.fetch_status(reference))
            .await
            .map_err(|_| {
                ChargeError::Transient(format!(
                    "{} status fetch timed out after {:?}",
                    charge.provider_type(),
                    self.settings.fetch_timeout
                ))
            })?
    }

    async fn record_failure(
        &self,
        charge: &Charge,
        err: &ChargeError,
        now: DateTime<Utc>,
        terminal: bool,
    ) -> Result<PollOutcome, ChargeError> {
        let attempts = charge.attempts_count();
        let attempts_count = attempts.saturating_add(1);
        let stalled = terminal || attempts_count >= self.settings.max_attempts;
        let next_poll_at = (!stalled)
            .then(|| now + poll_backoff(attempts, self.settings.poll_base, self.settings.poll_cap));

        let outcome = if terminal {
            AttemptOutcome::ProviderFailure
        } else if stalled {
            AttemptOutcome::Stalled
        } else {
            AttemptOutcome::TransientFailure
        };
        let detail = json!({
            "error": err.to_string(),
            "kind": err.kind(),
            "attempts_count": attempts_count,
        });
        let review = stalled.then(|| {
            let reason = if terminal {
                ReviewReason::TerminalProviderError
            } else {
                ReviewReason::Stalled
            };
            ReviewItem::open(charge.id(), reason, detail.clone(), now)
        });
        let attempt = ReconciliationAttempt::new(
            charge.id(),
            AttemptSource::Poll,
            &Actor::system("sweeper"),
            outcome,
            charge.status(),
            now,
        )
        .detail(detail)
        .next_attempt(next_poll_at);

        let recorded = self
            .store()
            .record_poll_failure(&PollFailure {
                charge_id: charge.id(),
                expected_version: charge.version(),
                attempts_count,
                next_poll_at,
                stalled,
                attempt,
                review,
            })
            .await?;
        if !recorded {
            tracing::debug!(
                charge_id = %charge.id(),
                error = %err,
                "charge changed while polling, failure dropped"
            );
            return Ok(PollOutcome::Superseded);
        }

        if stalled {
            tracing::warn!(
                charge_id = %charge.id(),
                provider = %charge.provider_type(),
                attempts_count,
                error = %err,
                "charge stalled, queued for review"
            );
        } else {
            tracing::info!(
                charge_id = %charge.id(),
                attempts_count,
                next_poll_at = ?next_poll_at,
                error = %err,
                "poll failed, rescheduled"
            );
        }
        Ok(PollOutcome::Failed { stalled })
    }
}

/// In-process sweep loop for `serve`.
pub async fn run_sweeper(
    sweeper: Arc<Sweeper>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(interval_secs = interval.as_secs(), "sweeper started");

    loop {
        if let Err(e) = sweeper.sweep_once().await {
            tracing::error!(error = %e, "sweep failed");
        }

        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("sweeper shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
