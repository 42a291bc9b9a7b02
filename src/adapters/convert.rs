//! Parsing helpers for values providers send in loosely specified formats.

use {
    crate::domain::{error::ChargeError, money::Money},
    chrono::{DateTime, NaiveDate, NaiveDateTime, Utc},
    rust_decimal::Decimal,
};

/// Provider amounts may carry extra precision; we keep cents.
pub fn provider_money(value: Decimal) -> Result<Money, ChargeError> {
    Money::new(value.round_dp(2))
}

/// Non-positive amounts mean "nothing received yet".
pub fn received_amount(value: Option<Decimal>) -> Result<Option<Money>, ChargeError> {
    match value {
        Some(v) if v > Decimal::ZERO => provider_money(v).map(Some),
        _ => Ok(None),
    }
}

pub fn cents_to_money(cents: Option<i64>) -> Result<Option<Money>, ChargeError> {
    match cents {
        Some(c) if c > 0 => Money::from_cents(c).map(Some),
        _ => Ok(None),
    }
}

/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS` (taken as UTC) or a bare date.
pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn unparseable(provider: &str, err: serde_json::Error) -> ChargeError {
    ChargeError::Validation(format!("unparseable {provider} webhook body: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn timestamps_in_several_shapes() {
        let rfc = parse_timestamp(Some("2025-04-05T10:00:00-03:00")).unwrap();
        assert_eq!(rfc.to_rfc3339(), "2025-04-05T13:00:00+00:00");
        assert!(parse_timestamp(Some("2025-04-05T10:00:00")).is_some());
        assert_eq!(
            parse_timestamp(Some("2025-04-05")).unwrap().to_rfc3339(),
            "2025-04-05T00:00:00+00:00"
        );
        assert!(parse_timestamp(Some("yesterday")).is_none());
        assert!(parse_timestamp(None).is_none());
    }

    #[test]
    fn zero_received_is_none() {
        assert!(received_amount(Some(Decimal::ZERO)).unwrap().is_none());
        let paid = received_amount(Some(Decimal::from_str("700.004").unwrap())).unwrap();
        assert_eq!(paid.unwrap().to_string(), "700.00");
        assert!(cents_to_money(Some(0)).unwrap().is_none());
    }
}
