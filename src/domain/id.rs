use {
    super::error::ChargeError,
    super::provider::ProviderType,
    chrono::NaiveDate,
    derive_more::Display,
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    uuid::Uuid,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChargeId(Uuid);

impl ChargeId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EstablishmentId(i64);

impl EstablishmentId {
    pub fn new(id: i64) -> Result<Self, ChargeError> {
        if id <= 0 {
            return Err(ChargeError::Validation(format!(
                "EstablishmentId must be positive, got: {id}"
            )));
        }
        Ok(Self(id))
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

/// Identifier the provider assigned to an issued charge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderReference(String);

impl ProviderReference {
    pub fn new(reference: impl Into<String>) -> Result<Self, ChargeError> {
        let reference = reference.into();
        if reference.trim().is_empty() {
            return Err(ChargeError::Validation(
                "provider reference cannot be empty".into(),
            ));
        }
        Ok(Self(reference))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Webhook event identifier, unique per delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Result<Self, ChargeError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ChargeError::Validation("EventId cannot be empty".into()));
        }
        Ok(Self(id))
    }

    /// For providers whose notifications carry no id of their own.
    pub fn derived(provider: ProviderType, parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_str().as_bytes());
        for part in parts {
            hasher.update(b":");
            hasher.update(part.as_bytes());
        }
        Self(format!("{}_{}", provider.as_str(), hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Deterministic key for one logical charge creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(
        establishment: EstablishmentId,
        period_start: NaiveDate,
        period_end: NaiveDate,
        provider: ProviderType,
    ) -> Self {
        let material = format!(
            "royalty:{}:{}:{}:{}",
            establishment.get(),
            period_start,
            period_end,
            provider.as_str()
        );
        Self(hex::encode(Sha256::digest(material.as_bytes())))
    }

    pub fn from_stored(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Providers with short "our number" fields get a stable prefix.
    pub fn truncated(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }
}

/// Who asked for a change. Recorded on every audit row.
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    pub fn user(id: impl std::fmt::Display) -> Self {
        Self(format!("user:{id}"))
    }

    pub fn system(component: &str) -> Self {
        Self(format!("system:{component}"))
    }

    pub fn webhook(provider: ProviderType) -> Self {
        Self(format!("webhook:{}", provider.as_str()))
    }

    pub fn from_stored(actor: impl Into<String>) -> Self {
        Self(actor.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
