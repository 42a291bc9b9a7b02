use {
    crate::domain::provider::ProviderType,
    chrono::{DateTime, Utc},
    std::sync::atomic::{AtomicI64, AtomicU32, Ordering},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// Open period elapsed; the next call is a trial.
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_secs: i64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_secs: 60,
        }
    }
}

/// Per-provider breaker. Opens after `failure_threshold` consecutive
/// transient failures and stays open for `open_secs`.
pub struct CircuitBreaker {
    failure_count: AtomicU32,
    /// Unix seconds when the circuit opened, 0 while closed.
    opened_at: AtomicI64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            opened_at: AtomicI64::new(0),
            config,
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> CircuitState {
        let opened_at = self.opened_at.load(Ordering::Acquire);
        if opened_at == 0 {
            return CircuitState::Closed;
        }
        if now.timestamp().saturating_sub(opened_at) >= self.config.open_secs {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    pub fn allows(&self, now: DateTime<Utc>) -> bool {
        self.state(now) != CircuitState::Open
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.opened_at.store(0, Ordering::Release);
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold {
            // A failed half-open trial re-opens with a fresh timestamp.
            self.opened_at.store(now.timestamp().max(1), Ordering::Release);
        }
    }
}

/// One breaker per provider type.
pub struct ProviderBreakers {
    breakers: [CircuitBreaker; 4],
}

impl ProviderBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: std::array::from_fn(|_| CircuitBreaker::new(config)),
        }
    }

    pub fn get(&self, provider: ProviderType) -> &CircuitBreaker {
        let idx = match provider {
            ProviderType::Boleto => 0,
            ProviderType::CardInvoice => 1,
            ProviderType::UnifiedCheckout => 2,
            ProviderType::Wallet => 3,
        };
        &self.breakers[idx]
    }
}
