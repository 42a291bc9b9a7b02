use {
    super::charge::ChargeStatus,
    super::error::ChargeError,
    super::id::{Actor, ChargeId, EventId},
    super::provider::ProviderType,
    chrono::{DateTime, Utc},
    serde::Serialize,
    std::fmt,
    uuid::Uuid,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptSource {
    Webhook,
    Poll,
    Manual,
    Issue,
}

impl AttemptSource {
    pub const ALL: [AttemptSource; 4] = [Self::Webhook, Self::Poll, Self::Manual, Self::Issue];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Poll => "poll",
            Self::Manual => "manual",
            Self::Issue => "issue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Applied,
    Unchanged,
    Stale,
    IllegalTransition,
    TransientFailure,
    ProviderFailure,
    Stalled,
    Resumed,
    Rejected,
}

impl AttemptOutcome {
    pub const ALL: [AttemptOutcome; 9] = [
        Self::Applied,
        Self::Unchanged,
        Self::Stale,
        Self::IllegalTransition,
        Self::TransientFailure,
        Self::ProviderFailure,
        Self::Stalled,
        Self::Resumed,
        Self::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Unchanged => "unchanged",
            Self::Stale => "stale",
            Self::IllegalTransition => "illegal_transition",
            Self::TransientFailure => "transient_failure",
            Self::ProviderFailure => "provider_failure",
            Self::Stalled => "stalled",
            Self::Resumed => "resumed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for AttemptSource {
    type Error = ChargeError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| ChargeError::Invariant(format!("unknown attempt source: {s}")))
    }
}

impl TryFrom<&str> for AttemptOutcome {
    type Error = ChargeError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| ChargeError::Invariant(format!("unknown attempt outcome: {s}")))
    }
}

/// Append-only trail entry for every poll, webhook or manual application.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationAttempt {
    pub id: Uuid,
    pub charge_id: ChargeId,
    pub source: AttemptSource,
    pub actor: Actor,
    pub outcome: AttemptOutcome,
    pub from_status: ChargeStatus,
    pub to_status: Option<ChargeStatus>,
    pub external_event_id: Option<EventId>,
    pub detail: serde_json::Value,
    pub attempted_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl ReconciliationAttempt {
    pub fn new(
        charge_id: ChargeId,
        source: AttemptSource,
        actor: &Actor,
        outcome: AttemptOutcome,
        from_status: ChargeStatus,
        attempted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            charge_id,
            source,
            actor: actor.clone(),
            outcome,
            from_status,
            to_status: None,
            external_event_id: None,
            detail: serde_json::json!({}),
            attempted_at,
            next_attempt_at: None,
        }
    }

    pub fn to(mut self, status: ChargeStatus) -> Self {
        self.to_status = Some(status);
        self
    }

    pub fn event(mut self, event_id: Option<&EventId>) -> Self {
        self.external_event_id = event_id.cloned();
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn next_attempt(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_attempt_at = at;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    TerminalProviderError,
    IllegalTransition,
    Stalled,
    Invariant,
}

impl ReviewReason {
    pub const ALL: [ReviewReason; 4] = [
        Self::TerminalProviderError,
        Self::IllegalTransition,
        Self::Stalled,
        Self::Invariant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TerminalProviderError => "terminal_provider_error",
            Self::IllegalTransition => "illegal_transition",
            Self::Stalled => "stalled",
            Self::Invariant => "invariant",
        }
    }
}

impl TryFrom<&str> for ReviewReason {
    type Error = ChargeError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| ChargeError::Invariant(format!("unknown review reason: {s}")))
    }
}

/// Operator queue entry.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewItem {
    pub id: Uuid,
    pub charge_id: ChargeId,
    pub reason: ReviewReason,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReviewItem {
    pub fn open(
        charge_id: ChargeId,
        reason: ReviewReason,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            charge_id,
            reason,
            detail,
            created_at: now,
            resolved_at: None,
        }
    }
}

/// Webhook delivery as recorded in the idempotency ledger.
#[derive(Debug, Clone, Serialize)]
pub struct NewWebhookEvent {
    pub external_event_id: EventId,
    pub provider_type: ProviderType,
    pub raw_payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub external_event_id: EventId,
    pub provider_type: ProviderType,
    pub charge_id: Option<ChargeId>,
    pub raw_payload: serde_json::Value,
    pub outcome: String,
    pub received_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}
