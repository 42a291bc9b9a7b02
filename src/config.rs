//! Process configuration from the environment (a `.env` file is honoured).

use {
    crate::{
        adapters::{
            circuit_breaker::CircuitBreakerConfig, registry::AdapterSettings, retry::RetryPolicy,
        },
        domain::provider::ProviderType,
        services::{
            lifecycle::LifecycleSettings, reconciliation::ReconciliationSettings,
            sweep::SweepSettings,
        },
    },
    chrono::TimeDelta,
    std::{collections::HashMap, env, fmt, net::SocketAddr, str::FromStr, sync::Arc, time::Duration},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Per-provider webhook secrets. Never printed.
#[derive(Clone, Default)]
pub struct WebhookSecrets(HashMap<ProviderType, Arc<str>>);

impl WebhookSecrets {
    pub fn with(mut self, provider: ProviderType, secret: impl Into<Arc<str>>) -> Self {
        self.0.insert(provider, secret.into());
        self
    }

    pub fn get(&self, provider: ProviderType) -> Option<&str> {
        self.0.get(&provider).map(|s| &**s)
    }
}

impl fmt::Debug for WebhookSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut configured: Vec<&str> = self.0.keys().map(|p| p.as_str()).collect();
        configured.sort_unstable();
        f.debug_tuple("WebhookSecrets").field(&configured).finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub webhook_secrets: WebhookSecrets,
    pub sweep_interval: Duration,
    pub sweep_batch_size: i64,
    pub sweep_concurrency: usize,
    pub provider_timeout: Duration,
    pub poll_base: Duration,
    pub poll_cap: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: i32,
    pub issue_max_attempts: usize,
    pub due_days: u64,
    pub breaker_threshold: u32,
    pub breaker_open: Duration,
}

fn secret_var(provider: ProviderType) -> &'static str {
    match provider {
        ProviderType::Boleto => "WEBHOOK_SECRET_BOLETO",
        ProviderType::CardInvoice => "WEBHOOK_SECRET_CARD_INVOICE",
        ProviderType::UnifiedCheckout => "WEBHOOK_SECRET_UNIFIED_CHECKOUT",
        ProviderType::Wallet => "WEBHOOK_SECRET_WALLET",
    }
}

fn parsed<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn seconds<F>(lookup: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parsed(lookup, name, default)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: "0".into(),
            reason: "must be positive".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok().filter(|v| !v.is_empty()))
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let webhook_secrets = ProviderType::ALL
            .into_iter()
            .fold(WebhookSecrets::default(), |secrets, provider| {
                match lookup(secret_var(provider)) {
                    Some(secret) => secrets.with(provider, secret),
                    None => secrets,
                }
            });

        let config = Self {
            database_url,
            listen_addr: parsed(&lookup, "LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            webhook_secrets,
            sweep_interval: seconds(&lookup, "SWEEP_INTERVAL_SECS", 120)?,
            sweep_batch_size: parsed(&lookup, "SWEEP_BATCH_SIZE", 200)?,
            sweep_concurrency: parsed(&lookup, "SWEEP_CONCURRENCY", 8)?,
            provider_timeout: seconds(&lookup, "PROVIDER_TIMEOUT_SECS", 30)?,
            poll_base: seconds(&lookup, "POLL_BASE_SECS", 60)?,
            poll_cap: seconds(&lookup, "POLL_CAP_SECS", 3600)?,
            poll_interval: seconds(&lookup, "POLL_INTERVAL_SECS", 3600)?,
            max_poll_attempts: parsed(&lookup, "MAX_POLL_ATTEMPTS", 50)?,
            issue_max_attempts: parsed(&lookup, "ISSUE_MAX_ATTEMPTS", 5)?,
            due_days: parsed(&lookup, "DUE_DAYS", 10)?,
            breaker_threshold: parsed(&lookup, "BREAKER_THRESHOLD", 5)?,
            breaker_open: seconds(&lookup, "BREAKER_OPEN_SECS", 60)?,
        };

        if config.poll_cap < config.poll_base {
            return Err(ConfigError::Invalid {
                name: "POLL_CAP_SECS",
                value: config.poll_cap.as_secs().to_string(),
                reason: "must not be below POLL_BASE_SECS".into(),
            });
        }
        Ok(config)
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            timeout: self.provider_timeout,
            retry: RetryPolicy::default(),
        }
    }

    pub fn reconciliation_settings(&self) -> ReconciliationSettings {
        ReconciliationSettings {
            poll_interval: delta(self.poll_interval),
        }
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            batch_size: self.sweep_batch_size,
            concurrency: self.sweep_concurrency,
            fetch_timeout: self.provider_timeout,
            poll_base: delta(self.poll_base),
            poll_cap: delta(self.poll_cap),
            max_attempts: self.max_poll_attempts,
        }
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            due_days: self.due_days,
            issue_retry: RetryPolicy::default().with_max_attempts(self.issue_max_attempts),
            ..LifecycleSettings::default()
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_threshold,
            open_secs: i64::try_from(self.breaker_open.as_secs()).unwrap_or(i64::MAX),
        }
    }
}
