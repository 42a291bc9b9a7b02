use {
    super::charge::Payer,
    super::error::ChargeError,
    super::id::{ChargeId, EstablishmentId, EventId, IdempotencyKey, ProviderReference},
    super::money::Money,
    chrono::{DateTime, NaiveDate, Utc},
    serde::{Deserialize, Serialize},
    std::{fmt, future::Future, pin::Pin, str::FromStr},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Boleto,
    CardInvoice,
    UnifiedCheckout,
    Wallet,
}

impl ProviderType {
    pub const ALL: [ProviderType; 4] = [
        Self::Boleto,
        Self::CardInvoice,
        Self::UnifiedCheckout,
        Self::Wallet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boleto => "boleto",
            Self::CardInvoice => "card_invoice",
            Self::UnifiedCheckout => "unified_checkout",
            Self::Wallet => "wallet",
        }
    }

    /// URL path segment used by the webhook routes.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Boleto => "boleto",
            Self::CardInvoice => "card-invoice",
            Self::UnifiedCheckout => "unified-checkout",
            Self::Wallet => "wallet",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = ChargeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s || p.slug() == s)
            .ok_or_else(|| ChargeError::NotFound(format!("unknown provider type: {s}")))
    }
}

impl TryFrom<&str> for ProviderType {
    type Error = ChargeError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Everything an adapter needs to issue one charge.
#[derive(Debug, Clone)]
pub struct ChargeDetails {
    pub charge_id: ChargeId,
    pub establishment_id: EstablishmentId,
    pub amount: Money,
    pub due_date: NaiveDate,
    pub description: String,
    pub payer: Payer,
    /// An earlier attempt for this charge may have reached the provider.
    /// Adapters that can look a charge up by our key should do so first.
    pub possibly_issued: bool,
}

/// Provider-specific payment data (boleto lines, checkout URL, PIX QR).
/// Stored as-is; upper layers never look inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentInstrument(serde_json::Value);

impl PaymentInstrument {
    pub fn new(bundle: serde_json::Value) -> Self {
        Self(bundle)
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct IssuedCharge {
    pub reference: ProviderReference,
    pub instrument: PaymentInstrument,
}

/// What the reconciliation layer gets back after asking the provider.
#[derive(Debug, Clone)]
pub struct FetchedStatus {
    pub native_status: String,
    pub paid_amount: Option<Money>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// One status report parsed out of a webhook body.
#[derive(Debug, Clone)]
pub struct WebhookNotification {
    pub event_id: EventId,
    pub reference: ProviderReference,
    pub native_status: String,
    pub paid_amount: Option<Money>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Bearer credential returned by `authenticate`. Never printed.
#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ChargeError>> + Send + 'a>>;

/// One implementation per provider type. Every implementation classifies
/// failures into the same `ChargeError` kinds regardless of transport.
pub trait ProviderAdapter: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    fn authenticate(&self) -> ProviderFuture<'_, AccessToken>;

    fn issue_charge<'a>(
        &'a self,
        details: &'a ChargeDetails,
        key: &'a IdempotencyKey,
    ) -> ProviderFuture<'a, IssuedCharge>;

    fn fetch_status<'a>(&'a self, reference: &'a ProviderReference)
    -> ProviderFuture<'a, FetchedStatus>;

    /// Best effort. Providers without cancellation return `Unsupported`.
    fn cancel<'a>(&'a self, reference: &'a ProviderReference) -> ProviderFuture<'a, ()>;
}
