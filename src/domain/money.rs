use {
    super::error::ChargeError,
    rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive},
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// Non-negative BRL amount with two decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub fn new(value: Decimal) -> Result<Self, ChargeError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(ChargeError::Validation(format!(
                "Money cannot be negative, got: {value}"
            )));
        }
        if value.scale() > 2 && value != value.round_dp(2) {
            return Err(ChargeError::Validation(format!(
                "Money has more than two decimal places: {value}"
            )));
        }
        Ok(Self(value.round_dp(2)))
    }

    pub fn from_cents(cents: i64) -> Result<Self, ChargeError> {
        Self::new(Decimal::new(cents, 2))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn cents(&self) -> Result<i64, ChargeError> {
        (self.0 * Decimal::ONE_HUNDRED)
            .to_i64()
            .ok_or_else(|| ChargeError::Validation(format!("amount out of range: {}", self.0)))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Revenue share, strictly between 0 and 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeePercentage(Decimal);

impl FeePercentage {
    pub fn new(value: Decimal) -> Result<Self, ChargeError> {
        if value <= Decimal::ZERO || value >= Decimal::ONE {
            return Err(ChargeError::Validation(format!(
                "fee_percentage must be in (0, 1), got: {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for FeePercentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `round(gross_revenue * fee_percentage, 2)`, half away from zero.
pub fn compute_fee(gross_revenue: Money, fee: FeePercentage) -> Money {
    let raw = gross_revenue.value() * fee.value();
    Money(raw.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}
