//! Webhook and polling both end in [`ReconciliationEngine::apply_status`].

use {
    super::notifier::{TransitionListener, spawn_notification},
    crate::{
        domain::{
            audit::{
                AttemptOutcome, AttemptSource, NewWebhookEvent, ReconciliationAttempt, ReviewItem,
                ReviewReason,
            },
            charge::{Charge, ChargeStatus, StatusDecision},
            error::ChargeError,
            id::{Actor, ChargeId},
            money::Money,
            provider::{FetchedStatus, ProviderType, WebhookNotification},
            status_map::map_status,
        },
        infra::store::{CommitOutcome, ReconciliationCommit, ScheduleUpdate, StatusChange, Store},
    },
    chrono::{DateTime, TimeDelta, Utc},
    serde_json::json,
    std::sync::Arc,
};

/// Re-read/re-decide rounds after losing an optimistic-concurrency race.
const MAX_ROUNDS: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct ReconciliationSettings {
    /// Regular cadence once a poll succeeds.
    pub poll_interval: TimeDelta,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            poll_interval: TimeDelta::hours(1),
        }
    }
}

/// What we observed and where it came from.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub source: AttemptSource,
    pub actor: Actor,
    pub native_status: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_amount: Option<Money>,
    /// Set on the webhook path; recording it is the dedup gate.
    pub event: Option<NewWebhookEvent>,
    pub observed_at: DateTime<Utc>,
}

impl Evidence {
    pub fn poll(fetched: &FetchedStatus, observed_at: DateTime<Utc>) -> Self {
        Self {
            source: AttemptSource::Poll,
            actor: Actor::system("sweeper"),
            native_status: Some(fetched.native_status.clone()),
            paid_at: fetched.paid_at,
            paid_amount: fetched.paid_amount,
            event: None,
            observed_at,
        }
    }

    pub fn webhook(
        provider: ProviderType,
        notification: &WebhookNotification,
        raw_payload: serde_json::Value,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: AttemptSource::Webhook,
            actor: Actor::webhook(provider),
            native_status: Some(notification.native_status.clone()),
            paid_at: notification.paid_at,
            paid_amount: notification.paid_amount,
            event: Some(NewWebhookEvent {
                external_event_id: notification.event_id.clone(),
                provider_type: provider,
                raw_payload,
                received_at: observed_at,
            }),
            observed_at,
        }
    }

    pub fn manual(actor: &Actor, observed_at: DateTime<Utc>) -> Self {
        Self {
            source: AttemptSource::Manual,
            actor: actor.clone(),
            native_status: None,
            paid_at: None,
            paid_amount: None,
            event: None,
            observed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    Advanced {
        from: ChargeStatus,
        to: ChargeStatus,
    },
    Unchanged,
    /// Older news for a charge still in flight; recorded, not applied.
    Stale {
        current: ChargeStatus,
        proposed: ChargeStatus,
    },
    /// Illegal move out of a terminal state; queued for review.
    Rejected {
        current: ChargeStatus,
        proposed: ChargeStatus,
    },
    /// Event id already in the ledger.
    Duplicate,
    /// Reference matched no charge; event recorded, nothing applied.
    Unmatched,
}

impl ApplyResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advanced { .. } => "applied",
            Self::Unchanged => "unchanged",
            Self::Stale { .. } => "stale",
            Self::Rejected { .. } => "rejected",
            Self::Duplicate => "duplicate",
            Self::Unmatched => "unmatched",
        }
    }
}

pub struct ReconciliationEngine {
    store: Arc<dyn Store>,
    listener: Arc<dyn TransitionListener>,
    settings: ReconciliationSettings,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        listener: Arc<dyn TransitionListener>,
        settings: ReconciliationSettings,
    ) -> Self {
        Self {
            store,
            listener,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn settings(&self) -> &ReconciliationSettings {
        &self.settings
    }

    /// Hands a committed transition to the listener without waiting for it.
    pub fn announce(&self, charge: &Charge, old: ChargeStatus, new: ChargeStatus) {
        spawn_notification(Arc::clone(&self.listener), charge.clone(), old, new);
    }

    /// Webhook entry point: dedup, map, locate the charge, apply.
    #[tracing::instrument(
        name = "ingest_webhook",
        skip_all,
        fields(provider = %provider, event_id = %notification.event_id)
    )]
    pub async fn ingest_webhook(
        &self,
        provider: ProviderType,
        notification: &WebhookNotification,
        raw_payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Result<ApplyResult, ChargeError> {
        if self.store.event_seen(&notification.event_id).await? {
            tracing::info!("duplicate event, already recorded");
            return Ok(ApplyResult::Duplicate);
        }

        let target = map_status(provider, &notification.native_status);
        let evidence = Evidence::webhook(provider, notification, raw_payload, received_at);

        let Some(charge) = self
            .store
            .find_by_reference(provider, &notification.reference)
            .await?
        else {
            let Some(event) = evidence.event.as_ref() else {
                return Err(ChargeError::Invariant("webhook evidence without event".into()));
            };
            let recorded = self.store.record_unmatched_event(event).await?;
            tracing::warn!(
                reference = %notification.reference,
                native_status = %notification.native_status,
                "webhook for unknown reference recorded without effect"
            );
            return Ok(if recorded {
                ApplyResult::Unmatched
            } else {
                ApplyResult::Duplicate
            });
        };

        self.apply_status(charge.id(), target, evidence).await
    }

    /// Decides and commits one status observation under optimistic concurrency.
    pub async fn apply_status(
        &self,
        charge_id: ChargeId,
        target: ChargeStatus,
        evidence: Evidence,
    ) -> Result<ApplyResult, ChargeError> {
        for round in 1..=MAX_ROUNDS {
            let charge = self
                .store
                .get_charge(charge_id)
                .await?
                .ok_or_else(|| ChargeError::NotFound(format!("charge {charge_id}")))?;

            let (commit, result) = self.plan(&charge, target, &evidence);
            match self.store.commit_reconciliation(&commit).await? {
                CommitOutcome::Committed(updated) => {
                    self.report(&updated, &result, &evidence);
                    return Ok(result);
                }
                CommitOutcome::DuplicateEvent => {
                    tracing::info!(charge_id = %charge_id, "event recorded concurrently, skipping");
                    return Ok(ApplyResult::Duplicate);
                }
                CommitOutcome::VersionConflict => {
                    tracing::debug!(charge_id = %charge_id, round, "version moved, re-deciding");
                }
            }
        }

        Err(ChargeError::Transient(format!(
            "charge {charge_id} kept changing during reconciliation"
        )))
    }

    fn plan(
        &self,
        charge: &Charge,
        target: ChargeStatus,
        evidence: &Evidence,
    ) -> (ReconciliationCommit, ApplyResult) {
        let current = charge.status();
        let now = evidence.observed_at;

        let (outcome, change, result) = match current.decide(target) {
            StatusDecision::Advance => {
                let paid = target == ChargeStatus::Paid;
                let change = StatusChange {
                    to: target,
                    paid_at: paid.then(|| evidence.paid_at.unwrap_or(now)),
                    paid_amount: paid.then(|| evidence.paid_amount.unwrap_or(charge.fee_amount())),
                };
                let result = ApplyResult::Advanced {
                    from: current,
                    to: target,
                };
                (AttemptOutcome::Applied, Some(change), result)
            }
            StatusDecision::Same => (AttemptOutcome::Unchanged, None, ApplyResult::Unchanged),
            StatusDecision::Stale => (
                AttemptOutcome::Stale,
                None,
                ApplyResult::Stale {
                    current,
                    proposed: target,
                },
            ),
            StatusDecision::Illegal => (
                AttemptOutcome::IllegalTransition,
                None,
                ApplyResult::Rejected {
                    current,
                    proposed: target,
                },
            ),
        };

        let resulting = change.as_ref().map_or(current, |c| c.to);
        let schedule = if resulting.is_terminal() {
            ScheduleUpdate::Set {
                attempts_count: 0,
                next_poll_at: None,
            }
        } else if evidence.source == AttemptSource::Poll {
            ScheduleUpdate::Set {
                attempts_count: 0,
                next_poll_at: Some(now + self.settings.poll_interval),
            }
        } else {
            ScheduleUpdate::Keep
        };
        let next_attempt = match schedule {
            ScheduleUpdate::Set { next_poll_at, .. } => next_poll_at,
            ScheduleUpdate::Keep => charge.next_poll_at(),
        };

        let detail = json!({
            "native_status": evidence.native_status,
            "proposed": target.as_str(),
        });
        let review = matches!(result, ApplyResult::Rejected { .. }).then(|| {
            ReviewItem::open(
                charge.id(),
                ReviewReason::IllegalTransition,
                json!({
                    "current": current.as_str(),
                    "proposed": target.as_str(),
                    "source": evidence.source.as_str(),
                    "native_status": evidence.native_status,
                    "event_id": evidence.event.as_ref().map(|e| e.external_event_id.as_str()),
                }),
                now,
            )
        });

        let attempt = ReconciliationAttempt::new(
            charge.id(),
            evidence.source,
            &evidence.actor,
            outcome,
            current,
            now,
        )
        .to(target)
        .event(evidence.event.as_ref().map(|e| &e.external_event_id))
        .detail(detail)
        .next_attempt(next_attempt);

        let commit = ReconciliationCommit {
            charge_id: charge.id(),
            expected_version: charge.version(),
            change,
            schedule,
            event: evidence.event.clone(),
            attempt,
            review,
        };
        (commit, result)
    }

    fn report(&self, charge: &Charge, result: &ApplyResult, evidence: &Evidence) {
        match result {
            ApplyResult::Advanced { from, to } => {
                tracing::info!(
                    charge_id = %charge.id(),
                    source = evidence.source.as_str(),
                    from = %from,
                    to = %to,
                    "status applied"
                );
                self.announce(charge, *from, *to);
            }
            ApplyResult::Rejected { current, proposed } => {
                tracing::warn!(
                    charge_id = %charge.id(),
                    source = evidence.source.as_str(),
                    current = %current,
                    proposed = %proposed,
                    "illegal transition discarded, queued for review"
                );
            }
            ApplyResult::Stale { current, proposed } => {
                tracing::debug!(
                    charge_id = %charge.id(),
                    current = %current,
                    proposed = %proposed,
                    "stale status ignored"
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{
            charge::{CreateChargeRequest, NewCharge, Payer},
            id::{EventId, ProviderReference},
            payable::NewPayableAccount,
            provider::{IssuedCharge, PaymentInstrument},
        },
        infra::{
            memory::MemoryStore,
            store::{ChargeRepository, IdempotencyLedger, IssueRecord},
        },
        services::notifier::TracingListener,
    };
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    async fn issued_charge(store: &MemoryStore) -> Charge {
        let request = CreateChargeRequest {
            establishment_id: 1,
            period_start: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
            gross_revenue: Decimal::new(1_000_000, 2),
            fee_percentage: Decimal::new(7, 2),
            provider_type: ProviderType::CardInvoice,
            payer: Payer {
                name: "Loja".into(),
                document: "12345678909".into(),
                email: "loja@example.com".into(),
            },
        };
        let draft = NewCharge::draft(&request.validate().unwrap(), 10, &Actor::system("test")).unwrap();
        let charge = store.insert_draft(&draft).await.unwrap().into_charge();
        let now = Utc::now();
        store
            .finalize_issue(&IssueRecord {
                charge_id: charge.id(),
                issued: IssuedCharge {
                    reference: ProviderReference::new("INV-1").unwrap(),
                    instrument: PaymentInstrument::new(json!({})),
                },
                payable: NewPayableAccount::for_charge(&charge),
                next_poll_at: now,
                attempt: ReconciliationAttempt::new(
                    charge.id(),
                    AttemptSource::Issue,
                    &Actor::system("test"),
                    AttemptOutcome::Applied,
                    ChargeStatus::Draft,
                    now,
                ),
            })
            .await
            .unwrap()
    }

    fn engine(store: Arc<MemoryStore>) -> ReconciliationEngine {
        ReconciliationEngine::new(store, Arc::new(TracingListener), ReconciliationSettings::default())
    }

    fn notification(event: &str, status: &str) -> WebhookNotification {
        WebhookNotification {
            event_id: EventId::new(event).unwrap(),
            reference: ProviderReference::new("INV-1").unwrap(),
            native_status: status.into(),
            paid_amount: None,
            paid_at: None,
        }
    }

    #[tokio::test]
    async fn paid_without_provider_timestamp_uses_now() {
        let store = Arc::new(MemoryStore::new());
        let charge = issued_charge(&store).await;
        let engine = engine(Arc::clone(&store));

        let now = Utc::now();
        let result = engine
            .ingest_webhook(ProviderType::CardInvoice, &notification("e1", "paid"), json!({}), now)
            .await
            .unwrap();
        assert_eq!(
            result,
            ApplyResult::Advanced {
                from: ChargeStatus::Submitted,
                to: ChargeStatus::Paid
            }
        );

        let stored = store.get_charge(charge.id()).await.unwrap().unwrap();
        assert_eq!(stored.paid_at(), Some(now));
        assert_eq!(stored.paid_amount(), Some(stored.fee_amount()));
        assert_eq!(stored.next_poll_at(), None);
    }

    #[tokio::test]
    async fn stale_webhook_keeps_status_without_review() {
        let store = Arc::new(MemoryStore::new());
        issued_charge(&store).await;
        let engine = engine(Arc::clone(&store));
        let now = Utc::now();

        engine
            .ingest_webhook(ProviderType::CardInvoice, &notification("e1", "expired"), json!({}), now)
            .await
            .unwrap();
        let result = engine
            .ingest_webhook(ProviderType::CardInvoice, &notification("e2", "pending"), json!({}), now)
            .await
            .unwrap();

        assert!(matches!(result, ApplyResult::Stale { current: ChargeStatus::Overdue, .. }));
        assert!(store.open_review_items().await.unwrap().is_empty());
        assert!(store.event_seen(&EventId::new("e2").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn missing_charge_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store);
        let result = engine
            .apply_status(
                ChargeId::generate(),
                ChargeStatus::Paid,
                Evidence::manual(&Actor::system("test"), Utc::now()),
            )
            .await;
        assert!(matches!(result, Err(ChargeError::NotFound(_))));
    }
}
