use {
    super::error::ChargeError,
    super::id::{Actor, ChargeId, EstablishmentId, IdempotencyKey, ProviderReference},
    super::money::{FeePercentage, Money, compute_fee},
    super::provider::{ChargeDetails, PaymentInstrument, ProviderType},
    chrono::{DateTime, Days, NaiveDate, Utc},
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// Provider-agnostic lifecycle state of a charge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    Draft,
    Submitted,
    AwaitingPayment,
    Paid,
    Overdue,
    Canceled,
    Rejected,
}

impl ChargeStatus {
    pub const ALL: [ChargeStatus; 7] = [
        Self::Draft,
        Self::Submitted,
        Self::AwaitingPayment,
        Self::Paid,
        Self::Overdue,
        Self::Canceled,
        Self::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::AwaitingPayment => "awaiting_payment",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::Canceled | Self::Rejected)
    }

    /// Lifecycle rank, higher means further along.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Draft => 0,
            Self::Submitted => 1,
            Self::AwaitingPayment => 2,
            Self::Overdue => 3,
            Self::Paid | Self::Canceled | Self::Rejected => 4,
        }
    }

    pub fn can_transition_to(&self, next: &ChargeStatus) -> bool {
        use ChargeStatus::*;
        matches!(
            (self, next),
            (Draft, Submitted | Rejected | Canceled)
                | (Submitted, AwaitingPayment | Paid | Overdue | Canceled | Rejected)
                | (AwaitingPayment, Paid | Overdue | Canceled | Rejected)
                | (Overdue, Paid | Canceled)
        )
    }

    pub fn decide(&self, proposed: ChargeStatus) -> StatusDecision {
        if *self == proposed {
            StatusDecision::Same
        } else if self.can_transition_to(&proposed) {
            StatusDecision::Advance
        } else if self.is_terminal() {
            StatusDecision::Illegal
        } else {
            StatusDecision::Stale
        }
    }
}

impl fmt::Display for ChargeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ChargeStatus {
    type Error = ChargeError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ChargeError::Validation(format!("unknown charge status: {s}")))
    }
}

/// Outcome of comparing a proposed status against the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDecision {
    /// Legal forward move.
    Advance,
    /// Already there.
    Same,
    /// Older news for a charge still in flight (e.g. `awaiting_payment` after `overdue`).
    Stale,
    /// Proposal out of a terminal state. Discarded and queued for review.
    Illegal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    start: NaiveDate,
    end: NaiveDate,
}

impl BillingPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ChargeError> {
        if end < start {
            return Err(ChargeError::Validation(format!(
                "period_end {end} is before period_start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }
}

/// Establishment being billed, as the providers need it on the slip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payer {
    pub name: String,
    /// CPF or CNPJ, digits only.
    pub document: String,
    pub email: String,
}

impl Payer {
    pub fn validate(&self) -> Result<(), ChargeError> {
        if self.name.trim().is_empty() {
            return Err(ChargeError::Validation("payer name is required".into()));
        }
        let digits = self.document.chars().filter(char::is_ascii_digit).count();
        if digits != 11 && digits != 14 {
            return Err(ChargeError::Validation(format!(
                "payer document must have 11 or 14 digits, got {digits}"
            )));
        }
        Ok(())
    }

    pub fn document_digits(&self) -> String {
        self.document.chars().filter(char::is_ascii_digit).collect()
    }

    pub fn is_company(&self) -> bool {
        self.document_digits().len() == 14
    }
}

/// Input of `ChargeLifecycleManager::create`. Raw values, validated by `validate`.
#[derive(Debug, Clone)]
pub struct CreateChargeRequest {
    pub establishment_id: i64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub gross_revenue: rust_decimal::Decimal,
    pub fee_percentage: rust_decimal::Decimal,
    pub provider_type: ProviderType,
    pub payer: Payer,
}

#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub establishment_id: EstablishmentId,
    pub period: BillingPeriod,
    pub gross_revenue: Money,
    pub fee_percentage: FeePercentage,
    pub provider_type: ProviderType,
    pub payer: Payer,
}

impl CreateChargeRequest {
    pub fn validate(&self) -> Result<ValidatedRequest, ChargeError> {
        let establishment_id = EstablishmentId::new(self.establishment_id)?;
        let period = BillingPeriod::new(self.period_start, self.period_end)?;
        let gross_revenue = Money::new(self.gross_revenue)?;
        if gross_revenue.is_zero() {
            return Err(ChargeError::Validation(
                "gross_revenue must be greater than zero".into(),
            ));
        }
        let fee_percentage = FeePercentage::new(self.fee_percentage)?;
        self.payer.validate()?;

        Ok(ValidatedRequest {
            establishment_id,
            period,
            gross_revenue,
            fee_percentage,
            provider_type: self.provider_type,
            payer: self.payer.clone(),
        })
    }
}

/// For INSERT of a draft. The id is generated in Rust via `Uuid::now_v7()`.
#[derive(Debug, Clone)]
pub struct NewCharge {
    pub id: ChargeId,
    pub establishment_id: EstablishmentId,
    pub period: BillingPeriod,
    pub gross_revenue: Money,
    pub fee_percentage: FeePercentage,
    pub fee_amount: Money,
    pub due_date: NaiveDate,
    pub provider_type: ProviderType,
    pub idempotency_key: IdempotencyKey,
    pub created_by: Actor,
}

impl NewCharge {
    pub fn draft(request: &ValidatedRequest, due_days: u64, actor: &Actor) -> Result<Self, ChargeError> {
        let due_date = request
            .period
            .end()
            .checked_add_days(Days::new(due_days))
            .ok_or_else(|| ChargeError::Validation("due date out of range".into()))?;

        Ok(Self {
            id: ChargeId::generate(),
            establishment_id: request.establishment_id,
            period: request.period,
            gross_revenue: request.gross_revenue,
            fee_percentage: request.fee_percentage,
            fee_amount: compute_fee(request.gross_revenue, request.fee_percentage),
            due_date,
            provider_type: request.provider_type,
            idempotency_key: IdempotencyKey::derive(
                request.establishment_id,
                request.period.start(),
                request.period.end(),
                request.provider_type,
            ),
            created_by: actor.clone(),
        })
    }
}

/// Full charge record from storage.
#[derive(Debug, Clone, Serialize)]
pub struct Charge {
    pub(crate) id: ChargeId,
    pub(crate) establishment_id: EstablishmentId,
    pub(crate) period: BillingPeriod,
    pub(crate) gross_revenue: Money,
    pub(crate) fee_percentage: FeePercentage,
    pub(crate) fee_amount: Money,
    pub(crate) due_date: NaiveDate,
    pub(crate) provider_type: ProviderType,
    pub(crate) provider_reference: Option<ProviderReference>,
    pub(crate) payment_instrument: Option<PaymentInstrument>,
    pub(crate) idempotency_key: IdempotencyKey,
    pub(crate) status: ChargeStatus,
    pub(crate) paid_at: Option<DateTime<Utc>>,
    pub(crate) paid_amount: Option<Money>,
    pub(crate) attempts_count: i32,
    pub(crate) next_poll_at: Option<DateTime<Utc>>,
    pub(crate) stalled: bool,
    /// Set while one caller is issuing the draft at the provider.
    pub(crate) issue_lease_until: Option<DateTime<Utc>>,
    pub(crate) version: i64,
    pub(crate) created_by: Actor,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl Charge {
    pub(crate) fn from_draft(new: &NewCharge, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            establishment_id: new.establishment_id,
            period: new.period,
            gross_revenue: new.gross_revenue,
            fee_percentage: new.fee_percentage,
            fee_amount: new.fee_amount,
            due_date: new.due_date,
            provider_type: new.provider_type,
            provider_reference: None,
            payment_instrument: None,
            idempotency_key: new.idempotency_key.clone(),
            status: ChargeStatus::Draft,
            paid_at: None,
            paid_amount: None,
            attempts_count: 0,
            next_poll_at: None,
            stalled: false,
            issue_lease_until: None,
            version: 0,
            created_by: new.created_by.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> ChargeId {
        self.id
    }

    pub fn establishment_id(&self) -> EstablishmentId {
        self.establishment_id
    }

    pub fn period(&self) -> BillingPeriod {
        self.period
    }

    pub fn gross_revenue(&self) -> Money {
        self.gross_revenue
    }

    pub fn fee_percentage(&self) -> FeePercentage {
        self.fee_percentage
    }

    pub fn fee_amount(&self) -> Money {
        self.fee_amount
    }

    pub fn due_date(&self) -> NaiveDate {
        self.due_date
    }

    pub fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    pub fn provider_reference(&self) -> Option<&ProviderReference> {
        self.provider_reference.as_ref()
    }

    pub fn payment_instrument(&self) -> Option<&PaymentInstrument> {
        self.payment_instrument.as_ref()
    }

    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.idempotency_key
    }

    pub fn status(&self) -> ChargeStatus {
        self.status
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    pub fn paid_amount(&self) -> Option<Money> {
        self.paid_amount
    }

    pub fn attempts_count(&self) -> i32 {
        self.attempts_count
    }

    pub fn next_poll_at(&self) -> Option<DateTime<Utc>> {
        self.next_poll_at
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn issue_lease_until(&self) -> Option<DateTime<Utc>> {
        self.issue_lease_until
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn created_by(&self) -> &Actor {
        &self.created_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_issued(&self) -> bool {
        self.provider_reference.is_some()
    }

    /// Stored fee must equal the recomputed fee. A mismatch is a programming error.
    pub fn verify_fee(&self) -> Result<(), ChargeError> {
        let expected = compute_fee(self.gross_revenue, self.fee_percentage);
        if expected != self.fee_amount {
            tracing::error!(
                charge_id = %self.id,
                stored = %self.fee_amount,
                expected = %expected,
                "fee_amount does not match gross_revenue * fee_percentage"
            );
            return Err(ChargeError::Invariant(format!(
                "charge {} has fee_amount {} but expected {}",
                self.id, self.fee_amount, expected
            )));
        }
        Ok(())
    }

    pub fn details(&self, payer: &Payer) -> ChargeDetails {
        ChargeDetails {
            charge_id: self.id,
            establishment_id: self.establishment_id,
            amount: self.fee_amount,
            due_date: self.due_date,
            description: format!(
                "Royalties {} a {}",
                self.period.start().format("%d/%m/%Y"),
                self.period.end().format("%d/%m/%Y")
            ),
            payer: payer.clone(),
            possibly_issued: false,
        }
    }
}
