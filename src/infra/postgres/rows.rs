use {
    crate::domain::{
        audit::{AttemptOutcome, AttemptSource, ReconciliationAttempt, ReviewItem, ReviewReason},
        charge::{BillingPeriod, Charge, ChargeStatus},
        credential::{CredentialSecret, GatewayCredential},
        error::ChargeError,
        id::{Actor, ChargeId, EstablishmentId, EventId, IdempotencyKey, ProviderReference},
        money::{FeePercentage, Money},
        payable::PayableAccount,
        provider::{PaymentInstrument, ProviderType},
    },
    chrono::{DateTime, NaiveDate, Utc},
    rust_decimal::Decimal,
    uuid::Uuid,
};

/// Column list matching [`ChargeRow`]. A macro so it can go through `concat!`.
macro_rules! charge_columns {
    () => {
        "id, establishment_id, period_start, period_end, gross_revenue, fee_percentage, \
         fee_amount, due_date, provider_type, provider_reference_id, payment_instrument, \
         idempotency_key, status, paid_at, paid_amount, attempts_count, next_poll_at, \
         stalled, issue_lease_until, version, created_by, created_at, updated_at"
    };
}
pub(crate) use charge_columns;

#[derive(Debug, sqlx::FromRow)]
pub struct ChargeRow {
    pub id: Uuid,
    pub establishment_id: i64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub gross_revenue: Decimal,
    pub fee_percentage: Decimal,
    pub fee_amount: Decimal,
    pub due_date: NaiveDate,
    pub provider_type: String,
    pub provider_reference_id: Option<String>,
    pub payment_instrument: Option<serde_json::Value>,
    pub idempotency_key: String,
    pub status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_amount: Option<Decimal>,
    pub attempts_count: i32,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub stalled: bool,
    pub issue_lease_until: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ChargeRow> for Charge {
    type Error = ChargeError;

    fn try_from(row: ChargeRow) -> Result<Self, Self::Error> {
        Ok(Charge {
            id: ChargeId::from_uuid(row.id),
            establishment_id: EstablishmentId::new(row.establishment_id)?,
            period: BillingPeriod::new(row.period_start, row.period_end)?,
            gross_revenue: Money::new(row.gross_revenue)?,
            fee_percentage: FeePercentage::new(row.fee_percentage)?,
            fee_amount: Money::new(row.fee_amount)?,
            due_date: row.due_date,
            provider_type: ProviderType::try_from(row.provider_type.as_str())?,
            provider_reference: row
                .provider_reference_id
                .map(ProviderReference::new)
                .transpose()?,
            payment_instrument: row.payment_instrument.map(PaymentInstrument::new),
            idempotency_key: IdempotencyKey::from_stored(row.idempotency_key),
            status: ChargeStatus::try_from(row.status.as_str())?,
            paid_at: row.paid_at,
            paid_amount: row.paid_amount.map(Money::new).transpose()?,
            attempts_count: row.attempts_count,
            next_poll_at: row.next_poll_at,
            stalled: row.stalled,
            issue_lease_until: row.issue_lease_until,
            version: row.version,
            created_by: Actor::from_stored(row.created_by),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct PayableRow {
    pub id: Uuid,
    pub establishment_id: i64,
    pub charge_id: Uuid,
    pub amount: Decimal,
    pub due_date: NaiveDate,
    pub status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PayableRow> for PayableAccount {
    type Error = ChargeError;

    fn try_from(row: PayableRow) -> Result<Self, Self::Error> {
        Ok(PayableAccount {
            id: row.id,
            establishment_id: EstablishmentId::new(row.establishment_id)?,
            charge_id: ChargeId::from_uuid(row.charge_id),
            amount: Money::new(row.amount)?,
            due_date: row.due_date,
            status: ChargeStatus::try_from(row.status.as_str())?,
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct AttemptRow {
    pub id: Uuid,
    pub charge_id: Uuid,
    pub source: String,
    pub actor: String,
    pub outcome: String,
    pub from_status: String,
    pub to_status: Option<String>,
    pub external_event_id: Option<String>,
    pub detail: serde_json::Value,
    pub attempted_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl TryFrom<AttemptRow> for ReconciliationAttempt {
    type Error = ChargeError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(ReconciliationAttempt {
            id: row.id,
            charge_id: ChargeId::from_uuid(row.charge_id),
            source: AttemptSource::try_from(row.source.as_str())?,
            actor: Actor::from_stored(row.actor),
            outcome: AttemptOutcome::try_from(row.outcome.as_str())?,
            from_status: ChargeStatus::try_from(row.from_status.as_str())?,
            to_status: row
                .to_status
                .as_deref()
                .map(ChargeStatus::try_from)
                .transpose()?,
            external_event_id: row.external_event_id.map(EventId::new).transpose()?,
            detail: row.detail,
            attempted_at: row.attempted_at,
            next_attempt_at: row.next_attempt_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct ReviewRow {
    pub id: Uuid,
    pub charge_id: Uuid,
    pub reason: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReviewRow> for ReviewItem {
    type Error = ChargeError;

    fn try_from(row: ReviewRow) -> Result<Self, Self::Error> {
        Ok(ReviewItem {
            id: row.id,
            charge_id: ChargeId::from_uuid(row.charge_id),
            reason: ReviewReason::try_from(row.reason.as_str())?,
            detail: row.detail,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct CredentialRow {
    pub id: Uuid,
    pub establishment_id: i64,
    pub provider_type: String,
    pub secret: serde_json::Value,
    pub base_url: Option<String>,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<CredentialRow> for GatewayCredential {
    type Error = ChargeError;

    fn try_from(row: CredentialRow) -> Result<Self, Self::Error> {
        let secret: CredentialSecret = serde_json::from_value(row.secret)?;
        Ok(GatewayCredential {
            id: row.id,
            establishment_id: EstablishmentId::new(row.establishment_id)?,
            provider_type: ProviderType::try_from(row.provider_type.as_str())?,
            secret,
            base_url: row.base_url,
            active: row.active,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}
