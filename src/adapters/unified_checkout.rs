//! Unified checkout platform. Long-lived bearer token; orders are created
//! with an `X-Idempotency-Key` header.

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

pub struct UnifiedCheckoutAdapter {
    http: ProviderHttpClient,
    token: String,
}

#[derive(Serialize)]
struct OrderRequest<'a> {
    external_reference: &'a str,
    items: [OrderItem<'a>; 1],
    payer: OrderPayer<'a>,
    date_of_expiration: String,
}

#[derive(Serialize)]
struct OrderItem<'a> {
    title: &'a str,
    quantity: u32,
    unit_price: Decimal,
}

#[derive(Serialize)]
struct OrderPayer<'a> {
    name: &'a str,
    email: &'a str,
    identification: Identification,
}

#[derive(Serialize)]
struct Identification {
    #[serde(rename = "type")]
    kind: &'static str,
    number: String,
}

#[derive(Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    checkout_url: Option<String>,
    #[serde(default)]
    paid_amount: Option<Decimal>,
    #[serde(default)]
    paid_at: Option<String>,
}

#[derive(Deserialize)]
struct Notification {
    id: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    data: NotificationData,
}

#[derive(Deserialize)]
struct NotificationData {
    id: String,
    status: String,
    #[serde(default)]
    paid_amount: Option<Decimal>,
    #[serde(default)]
    paid_at: Option<String>,
}

impl UnifiedCheckoutAdapter {
    pub fn new(credential: &GatewayCredential, settings: &AdapterSettings) -> Result<Self, ChargeError> {
        let CredentialSecret::AccessToken { token } = &credential.secret else {
            return Err(ChargeError::Configuration(format!(
                "unified checkout credential {} must be access_token, got {}",
                credential.id,
                credential.secret.kind()
            )));
        };

        Ok(Self {
            http: ProviderHttpClient::new(
                ProviderType::UnifiedCheckout,
                credential.base_url()?,
                settings.timeout,
                None,
            )?,
            token: token.clone(),
        })
    }

    fn auth(&self) -> RequestAuth {
        RequestAuth::Bearer(self.token.clone())
    }
}

impl ProviderAdapter for UnifiedCheckoutAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::UnifiedCheckout
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
            let expires = details
                .due_date
                .and_hms_opt(23, 59, 59)
                .map(|at| at.and_utc().to_rfc3339())
                .unwrap_or_default();
            let body = OrderRequest {
                external_reference: key.as_str(),
                items: [OrderItem {
                    title: &details.description,
                    quantity: 1,
                    unit_price: details.amount.value(),
                }],
                payer: OrderPayer {
                    name: &details.payer.name,
                    email: &details.payer.email,
                    identification: Identification {
                        kind: if details.payer.is_company() { "CNPJ" } else { "CPF" },
                        number: details.payer.document_digits(),
                    },
                },
                date_of_expiration: expires,
            };
            let order: OrderResponse = self
                .http
                .post_json(
                    "/checkout/orders",
                    &self.auth(),
                    &body,
                    &[("X-Idempotency-Key", key.as_str())],
                )
                .await?;

            tracing::debug!(order_id = %order.id, status = %order.status, "checkout order created");
            Ok(IssuedCharge {
                instrument: PaymentInstrument::new(serde_json::json!({
                    "checkout_url": order.checkout_url,
                })),
                reference: ProviderReference::new(order.id)?,
            })
        })
    }

    fn fetch_status<'a>(
        &'a self,
        reference: &'a ProviderReference,
    ) -> ProviderFuture<'a, FetchedStatus> {
        Box::pin(async move {
            let order: OrderResponse = self
                .http
                .get_json(&format!("/checkout/orders/{}", reference.as_str()), &self.auth())
                .await?;
            Ok(FetchedStatus {
                paid_amount: received_amount(order.paid_amount)?,
                paid_at: parse_timestamp(order.paid_at.as_deref()),
                native_status: order.status,
            })
        })
    }

    fn cancel<'a>(&'a self, reference: &'a ProviderReference) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.http
                .send_empty(
                    reqwest::Method::POST,
                    &format!("/checkout/orders/{}/cancel", reference.as_str()),
                    &self.auth(),
                    None,
                )
                .await
        })
    }
}

/// The signature covers only `data.id`, so the status parsed here is a hint;
/// the webhook handler replaces it with a fresh `fetch_status`.
pub fn parse_webhook(body: &[u8]) -> Result<Vec<WebhookNotification>, ChargeError> {
    let notification: Notification =
        serde_json::from_slice(body).map_err(|e| unparseable("unified checkout", e))?;
    tracing::debug!(
        event_id = %notification.id,
        kind = notification.kind.as_deref().unwrap_or("unknown"),
        "unified checkout notification"
    );
    Ok(vec![WebhookNotification {
        event_id: EventId::new(notification.id)?,
        reference: ProviderReference::new(notification.data.id)?,
        paid_amount: received_amount(notification.data.paid_amount)?,
        paid_at: parse_timestamp(notification.data.paid_at.as_deref()),
        native_status: notification.data.status,
    }])
}
