//! Webhook authenticity checks, one scheme per provider.

use {
    crate::domain::{error::ChargeError, provider::ProviderType},
    axum::http::HeaderMap,
    chrono::{DateTime, Utc},
    hmac::{Hmac, Mac},
    sha2::{Digest, Sha256},
    subtle::ConstantTimeEq,
};

type HmacSha256 = Hmac<Sha256>;

/// Max age of a timestamped signature.
const TOLERANCE_SECS: i64 = 300;

fn rejected(msg: impl Into<String>) -> ChargeError {
    ChargeError::WebhookSignature(msg.into())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ChargeError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .ok_or_else(|| rejected(format!("missing {name} header")))
}

/// `k=v,k=v` pairs as sent by the timestamped schemes.
fn pairs(raw: &str) -> impl Iterator<Item = (&str, &str)> {
    raw.split(',').filter_map(|part| part.trim().split_once('='))
}

fn field<'a>(raw: &'a str, key: &str) -> Result<&'a str, ChargeError> {
    pairs(raw)
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
        .ok_or_else(|| rejected(format!("signature header lacks {key}")))
}

fn mac(secret: &str) -> Result<HmacSha256, ChargeError> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| rejected("unusable webhook secret"))
}

/// Compares a hex digest against the MAC in constant time.
fn check_hex(mac: HmacSha256, provided_hex: &str) -> Result<(), ChargeError> {
    let provided = hex::decode(provided_hex).map_err(|_| rejected("signature is not hex"))?;
    mac.verify_slice(&provided)
        .map_err(|_| rejected("signature mismatch"))
}

/// Hashing first keeps the comparison length-independent.
fn tokens_match(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes())
        .ct_eq(&Sha256::digest(b.as_bytes()))
        .into()
}

fn verify_boleto(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<(), ChargeError> {
    let raw = header(headers, "x-webhook-signature")?;
    let digest = raw.strip_prefix("sha256=").unwrap_or(raw);
    let mut mac = mac(secret)?;
    mac.update(body);
    check_hex(mac, digest)
}

fn check_fresh(ts: &str, now: DateTime<Utc>) -> Result<(), ChargeError> {
    let issued: i64 = ts.parse().map_err(|_| rejected("bad signature timestamp"))?;
    if (now.timestamp() - issued).abs() > TOLERANCE_SECS {
        return Err(rejected("signature timestamp outside tolerance"));
    }
    Ok(())
}

fn verify_card_invoice(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
    now: DateTime<Utc>,
) -> Result<(), ChargeError> {
    let raw = header(headers, "x-signature")?;
    let ts = field(raw, "t")?;
    let v1 = field(raw, "v1")?;
    check_fresh(ts, now)?;

    let mut mac = mac(secret)?;
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(body);
    check_hex(mac, v1)
}

fn verify_unified_checkout(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
    now: DateTime<Utc>,
) -> Result<(), ChargeError> {
    let raw = header(headers, "x-signature")?;
    let ts = field(raw, "ts")?;
    let v1 = field(raw, "v1")?;
    check_fresh(ts, now)?;

    // The manifest signs the resource id, not the body. See `signs_body`.
    let payload: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| rejected("cannot read data.id to verify"))?;
    let data_id = match payload.pointer("/data/id") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return Err(rejected("notification has no data.id")),
    };

    let mut mac = mac(secret)?;
    mac.update(format!("id:{data_id};ts:{ts};").as_bytes());
    check_hex(mac, v1)
}

fn verify_wallet(headers: &HeaderMap, secret: &str) -> Result<(), ChargeError> {
    let provided = header(headers, "x-wallet-token")?;
    if tokens_match(provided, secret) {
        Ok(())
    } else {
        Err(rejected("wallet token mismatch"))
    }
}

/// Verifies one delivery. A provider with no configured secret accepts nothing.
pub fn verify(
    provider: ProviderType,
    headers: &HeaderMap,
    body: &[u8],
    secret: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), ChargeError> {
    let secret = secret
        .filter(|s| !s.is_empty())
        .ok_or_else(|| rejected(format!("no webhook secret configured for {provider}")))?;

    match provider {
        ProviderType::Boleto => verify_boleto(headers, body, secret),
        ProviderType::CardInvoice => verify_card_invoice(headers, body, secret, now),
        ProviderType::UnifiedCheckout => verify_unified_checkout(headers, body, secret, now),
        ProviderType::Wallet => verify_wallet(headers, secret),
    }
}

/// Produces the header value a provider would send. Used by tests and by
/// operators replaying captured deliveries.
pub fn sign(provider: ProviderType, body: &[u8], secret: &str, at: DateTime<Utc>) -> Result<String, ChargeError> {
    let ts = at.timestamp().to_string();
    let value = match provider {
        ProviderType::Boleto => {
            let mut mac = mac(secret)?;
            mac.update(body);
            format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
        }
        ProviderType::CardInvoice => {
            let mut mac = mac(secret)?;
            mac.update(ts.as_bytes());
            mac.update(b".");
            mac.update(body);
            format!("t={ts},v1={}", hex::encode(mac.finalize().into_bytes()))
        }
        ProviderType::UnifiedCheckout => {
            let payload: serde_json::Value = serde_json::from_slice(body)?;
            let data_id = match payload.pointer("/data/id") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => return Err(rejected("notification has no data.id")),
            };
            let mut mac = mac(secret)?;
            mac.update(format!("id:{data_id};ts:{ts};").as_bytes());
            format!("ts={ts},v1={}", hex::encode(mac.finalize().into_bytes()))
        }
        ProviderType::Wallet => secret.to_string(),
    };
    Ok(value)
}

/// Whether a verified signature also vouches for the status in the body.
/// When it does not, the delivery only says which resource changed and the
/// status has to be read back from the provider.
pub fn signs_body(provider: ProviderType) -> bool {
    !matches!(provider, ProviderType::UnifiedCheckout)
}

/// Header the signature travels in.
pub fn header_name(provider: ProviderType) -> &'static str {
    match provider {
        ProviderType::Boleto => "x-webhook-signature",
        ProviderType::CardInvoice | ProviderType::UnifiedCheckout => "x-signature",
        ProviderType::Wallet => "x-wallet-token",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::Duration;

    fn signed(provider: ProviderType, body: &[u8], secret: &str, at: DateTime<Utc>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = sign(provider, body, secret, at).unwrap();
        headers.insert(header_name(provider), HeaderValue::from_str(&value).unwrap());
        headers
    }

    #[test]
    fn every_scheme_accepts_its_own_signature() {
        let body = br#"{"id": "n-1", "data": {"id": "ORD-1", "status": "paid"}}"#;
        let now = Utc::now();
        for provider in ProviderType::ALL {
            let headers = signed(provider, body, "s3cret", now);
            assert!(verify(provider, &headers, body, Some("s3cret"), now).is_ok(), "{provider}");
        }
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = b"[]";
        let now = Utc::now();
        let headers = signed(ProviderType::Boleto, body, "other", now);
        assert!(matches!(
            verify(ProviderType::Boleto, &headers, body, Some("s3cret"), now),
            Err(ChargeError::WebhookSignature(_))
        ));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let now = Utc::now();
        let headers = signed(ProviderType::CardInvoice, b"{\"a\":1}", "k", now);
        assert!(verify(ProviderType::CardInvoice, &headers, b"{\"a\":2}", Some("k"), now).is_err());
    }

    #[test]
    fn stale_card_invoice_signature_is_rejected() {
        let body = b"{}";
        let then = Utc::now() - Duration::seconds(TOLERANCE_SECS + 5);
        let headers = signed(ProviderType::CardInvoice, body, "k", then);
        assert!(verify(ProviderType::CardInvoice, &headers, body, Some("k"), Utc::now()).is_err());
    }

    #[test]
    fn stale_unified_checkout_signature_is_rejected() {
        let body = br#"{"id": "n-1", "data": {"id": "ORD-1", "status": "pending"}}"#;
        let then = Utc::now() - Duration::days(30);
        let headers = signed(ProviderType::UnifiedCheckout, body, "k", then);
        assert!(matches!(
            verify(ProviderType::UnifiedCheckout, &headers, body, Some("k"), Utc::now()),
            Err(ChargeError::WebhookSignature(_))
        ));
    }

    #[test]
    fn replayed_unified_checkout_header_on_new_body_is_rejected() {
        let genuine = br#"{"id": "n-1", "data": {"id": "ORD-1", "status": "pending"}}"#;
        let forged = br#"{"id": "n-forged", "data": {"id": "ORD-1", "status": "approved"}}"#;
        let then = Utc::now() - Duration::hours(1);
        let headers = signed(ProviderType::UnifiedCheckout, genuine, "k", then);
        assert!(verify(ProviderType::UnifiedCheckout, &headers, forged, Some("k"), Utc::now()).is_err());
    }

    #[test]
    fn only_unified_checkout_needs_a_status_read_back() {
        assert!(!signs_body(ProviderType::UnifiedCheckout));
        assert!(signs_body(ProviderType::Boleto));
        assert!(signs_body(ProviderType::CardInvoice));
        assert!(signs_body(ProviderType::Wallet));
    }

    #[test]
    fn missing_secret_or_header_is_rejected() {
        let body = b"{}";
        let now = Utc::now();
        let headers = signed(ProviderType::Wallet, body, "tok", now);
        assert!(verify(ProviderType::Wallet, &headers, body, None, now).is_err());
        assert!(verify(ProviderType::Wallet, &HeaderMap::new(), body, Some("tok"), now).is_err());
    }

    #[test]
    fn parses_pairs_with_spaces() {
        assert_eq!(field("t=1, v1=ab", "v1").unwrap(), "ab");
        assert!(field("garbage", "t").is_err());
    }
}
