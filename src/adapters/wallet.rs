//! Wallet/PIX provider. Every call carries the `x-wallet-token` header and the
//! payment is addressed by our own `referenceId`, so the idempotency key is
//! also the provider reference.

use {
    super::{
        convert::{parse_timestamp, received_amount, unparseable},
        http_client::{ProviderHttpClient, RequestAuth},
        registry::AdapterSettings,
    },
    crate::domain::{
        credential::{CredentialSecret, GatewayCredential},
        error::ChargeError,
        id::{EventId, IdempotencyKey, ProviderReference},
        provider::{
            AccessToken, ChargeDetails, FetchedStatus, IssuedCharge, PaymentInstrument,
            ProviderAdapter, ProviderFuture, ProviderType, WebhookNotification,
        },
    },
    rust_decimal::Decimal,
    serde::{Deserialize, Serialize},
};

const TOKEN_HEADER: &str = "x-wallet-token";

pub struct WalletAdapter {
    http: ProviderHttpClient,
    token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequest<'a> {
    reference_id: &'a str,
    value: Decimal,
    expires_at: String,
    buyer: Buyer<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Buyer<'a> {
    first_name: &'a str,
    document: String,
    email: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentResponse {
    reference_id: String,
    #[serde(default)]
    payment_url: Option<String>,
    #[serde(default)]
    qrcode: Option<QrCode>,
}

#[derive(Deserialize)]
struct QrCode {
    content: Option<String>,
    base64: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    #[serde(default)]
    authorization_id: Option<String>,
    #[serde(default)]
    paid_amount: Option<Decimal>,
    #[serde(default)]
    paid_at: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Callback {
    reference_id: String,
    status: String,
    #[serde(default)]
    authorization_id: Option<String>,
    #[serde(default)]
    paid_amount: Option<Decimal>,
    #[serde(default)]
    paid_at: Option<String>,
}

impl WalletAdapter {
    pub fn new(credential: &GatewayCredential, settings: &AdapterSettings) -> Result<Self, ChargeError> {
        let CredentialSecret::WalletToken { token, .. } = &credential.secret else {
            return Err(ChargeError::Configuration(format!(
                "wallet credential {} must be wallet_token, got {}",
                credential.id,
                credential.secret.kind()
            )));
        };

        Ok(Self {
            http: ProviderHttpClient::new(
                ProviderType::Wallet,
                credential.base_url()?,
                settings.timeout,
                None,
            )?,
            token: token.clone(),
        })
    }

    fn auth(&self) -> RequestAuth {
        RequestAuth::Header {
            name: TOKEN_HEADER,
            value: self.token.clone(),
        }
    }
}

impl ProviderAdapter for WalletAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Wallet
    }

    fn authenticate(&self) -> ProviderFuture<'_, AccessToken> {
        Box::pin(async move { Ok(AccessToken::new(self.token.clone())) })
    }

    fn issue_charge<'a>(
        &'a self,
        details: &'a ChargeDetails,
        key: &'a IdempotencyKey,
    ) -> ProviderFuture<'a, IssuedCharge> {
        Box::pin(async move {
            let expires_at = details
                .due_date
                .and_hms_opt(23, 59, 59)
                .map(|at| at.and_utc().to_rfc3339())
                .unwrap_or_default();
            let body = PaymentRequest {
                reference_id: key.as_str(),
                value: details.amount.value(),
                expires_at,
                buyer: Buyer {
                    first_name: &details.payer.name,
                    document: details.payer.document_digits(),
                    email: &details.payer.email,
                },
            };
            let payment: PaymentResponse = self
                .http
                .post_json("/ecommerce/public/payments", &self.auth(), &body, &[])
                .await?;

            if payment.reference_id != key.as_str() {
                return Err(ChargeError::Invariant(format!(
                    "wallet answered reference {} for key {}",
                    payment.reference_id, key
                )));
            }

            let qrcode = payment.qrcode.as_ref();
            Ok(IssuedCharge {
                instrument: PaymentInstrument::new(serde_json::json!({
                    "payment_url": payment.payment_url,
                    "qrcode_content": qrcode.and_then(|q| q.content.clone()),
                    "qrcode_base64": qrcode.and_then(|q| q.base64.clone()),
                })),
                reference: ProviderReference::new(payment.reference_id)?,
            })
        })
    }

    fn fetch_status<'a>(
        &'a self,
        reference: &'a ProviderReference,
    ) -> ProviderFuture<'a, FetchedStatus> {
        Box::pin(async move {
            let status: StatusResponse = self
                .http
                .get_json(
                    &format!("/ecommerce/public/payments/{}/status", reference.as_str()),
                    &self.auth(),
                )
                .await?;
            if let Some(authorization_id) = &status.authorization_id {
                tracing::debug!(reference = %reference, authorization_id, "wallet payment authorized");
            }
            Ok(FetchedStatus {
                paid_amount: received_amount(status.paid_amount)?,
                paid_at: parse_timestamp(status.paid_at.as_deref()),
                native_status: status.status,
            })
        })
    }

    /// The wallet API only reverses settled payments; an open request simply
    /// expires, so cancellation stays local.
    fn cancel<'a>(&'a self, reference: &'a ProviderReference) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            Err(ChargeError::Unsupported(format!(
                "wallet cannot cancel open payment {reference}"
            )))
        })
    }
}

/// Callbacks carry no id; one is derived from reference, status and
/// authorization so a redelivery maps to the same event.
pub fn parse_webhook(body: &[u8]) -> Result<Vec<WebhookNotification>, ChargeError> {
    let callback: Callback = serde_json::from_slice(body).map_err(|e| unparseable("wallet", e))?;
    let event_id = EventId::derived(
        ProviderType::Wallet,
        &[
            callback.reference_id.as_str(),
            callback.status.as_str(),
            callback.authorization_id.as_deref().unwrap_or(""),
        ],
    );
    Ok(vec![WebhookNotification {
        event_id,
        reference: ProviderReference::new(callback.reference_id)?,
        paid_amount: received_amount(callback.paid_amount)?,
        paid_at: parse_timestamp(callback.paid_at.as_deref()),
        native_status: callback.status,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        charge::Payer,
        credential::NewGatewayCredential,
        id::{ChargeId, EstablishmentId},
        money::Money,
    };
    use chrono::{NaiveDate, Utc};
    use httpmock::prelude::*;
    use serde_json::json;

    fn adapter(server: &MockServer) -> WalletAdapter {
        let credential = NewGatewayCredential {
            establishment_id: EstablishmentId::new(8).unwrap(),
            provider_type: ProviderType::Wallet,
            secret: CredentialSecret::WalletToken {
                token: "wt".into(),
                seller_token: "st".into(),
            },
            base_url: Some(server.base_url()),
            expires_at: None,
        }
        .into_active(Utc::now());
        WalletAdapter::new(&credential, &AdapterSettings::for_tests()).unwrap()
    }

    fn details() -> ChargeDetails {
        ChargeDetails {
            charge_id: ChargeId::generate(),
            establishment_id: EstablishmentId::new(8).unwrap(),
            amount: Money::from_cents(5000).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2025, 4, 10).unwrap(),
            description: "Royalties".into(),
            possibly_issued: false,
            payer: Payer {
                name: "Bruno".into(),
                document: "12345678909".into(),
                email: "bruno@example.com".into(),
            },
        }
    }

    #[tokio::test]
    async fn issue_uses_key_as_reference() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/ecommerce/public/payments")
                .header("x-wallet-token", "wt")
                .json_body_partial(r#"{"referenceId": "key-3"}"#);
            then.status(200).json_body(json!({
                "referenceId": "key-3",
                "paymentUrl": "https://wallet.example/pay/key-3",
                "qrcode": {"content": "000201", "base64": "iVBOR"}
            }));
        });

        let issued = adapter(&server)
            .issue_charge(&details(), &IdempotencyKey::from_stored("key-3"))
            .await
            .unwrap();
        mock.assert();
        assert_eq!(issued.reference.as_str(), "key-3");
        assert_eq!(issued.instrument.as_json()["qrcode_base64"], "iVBOR");
    }

    #[tokio::test]
    async fn bad_token_is_authentication() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/ecommerce/public/payments/key-3/status");
            then.status(401).json_body(json!({"message": "token invalido"}));
        });

        let result = adapter(&server)
            .fetch_status(&ProviderReference::new("key-3").unwrap())
            .await;
        assert!(matches!(result, Err(ChargeError::Authentication(_))));
    }

    #[tokio::test]
    async fn cancel_is_unsupported() {
        let server = MockServer::start();
        let result = adapter(&server)
            .cancel(&ProviderReference::new("key-3").unwrap())
            .await;
        assert!(matches!(result, Err(ChargeError::Unsupported(_))));
    }

    #[test]
    fn callback_ids_are_derived() {
        let paid = parse_webhook(br#"{"referenceId": "key-3", "status": "paid", "authorizationId": "a1"}"#)
            .unwrap();
        let expired = parse_webhook(br#"{"referenceId": "key-3", "status": "expired"}"#).unwrap();
        assert_ne!(paid[0].event_id, expired[0].event_id);
        assert!(paid[0].event_id.as_str().starts_with("wallet_"));
    }
}
