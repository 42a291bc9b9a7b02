//! Card/invoice processor. HTTP basic auth with the API token as username;
//! creation is deduplicated by the `Idempotency-Key` header.

use {
    super::{
        convert::{cents_to_money, parse_timestamp, unparseable},
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
    serde::{Deserialize, Serialize},
};

pub struct CardInvoiceAdapter {
    http: ProviderHttpClient,
    auth: RequestAuth,
    token: String,
}

#[derive(Serialize)]
struct InvoiceRequest<'a> {
    email: &'a str,
    due_date: String,
    order_id: &'a str,
    items: [InvoiceItem<'a>; 1],
    payer: InvoicePayer<'a>,
    payable_with: [&'static str; 2],
}

#[derive(Serialize)]
struct InvoiceItem<'a> {
    description: &'a str,
    quantity: u32,
    price_cents: i64,
}

#[derive(Serialize)]
struct InvoicePayer<'a> {
    cpf_cnpj: String,
    name: &'a str,
    email: &'a str,
}

#[derive(Deserialize)]
struct InvoiceResponse {
    id: String,
    status: String,
    #[serde(default)]
    secure_url: Option<String>,
    #[serde(default)]
    paid_at: Option<String>,
    #[serde(default)]
    paid_cents: Option<i64>,
    #[serde(default)]
    bank_slip: Option<BankSlip>,
    #[serde(default)]
    pix: Option<Pix>,
}

#[derive(Deserialize)]
struct BankSlip {
    digitable_line: Option<String>,
    barcode: Option<String>,
}

#[derive(Deserialize)]
struct Pix {
    qrcode_text: Option<String>,
}

#[derive(Deserialize)]
struct Callback {
    id: String,
    #[serde(default)]
    event: Option<String>,
    data: CallbackData,
}

#[derive(Deserialize)]
struct CallbackData {
    id: String,
    status: String,
    #[serde(default)]
    paid_at: Option<String>,
    #[serde(default)]
    paid_cents: Option<i64>,
}

impl CardInvoiceAdapter {
    pub fn new(credential: &GatewayCredential, settings: &AdapterSettings) -> Result<Self, ChargeError> {
        let CredentialSecret::ApiToken { token } = &credential.secret else {
            return Err(ChargeError::Configuration(format!(
                "card invoice credential {} must be api_token, got {}",
                credential.id,
                credential.secret.kind()
            )));
        };

        Ok(Self {
            http: ProviderHttpClient::new(
                ProviderType::CardInvoice,
                credential.base_url()?,
                settings.timeout,
                None,
            )?,
            auth: RequestAuth::Basic {
                username: token.clone(),
                password: String::new(),
            },
            token: token.clone(),
        })
    }
}

impl ProviderAdapter for CardInvoiceAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::CardInvoice
    }

    /// The API token is long-lived and sent on every call; nothing to exchange.
    fn authenticate(&self) -> ProviderFuture<'_, AccessToken> {
        Box::pin(async move { Ok(AccessToken::new(self.token.clone())) })
    }

    fn issue_charge<'a>(
        &'a self,
        details: &'a ChargeDetails,
        key: &'a IdempotencyKey,
    ) -> ProviderFuture<'a, IssuedCharge> {
        Box::pin(async move {
            let body = InvoiceRequest {
                email: &details.payer.email,
                due_date: details.due_date.format("%Y-%m-%d").to_string(),
                order_id: key.as_str(),
                items: [InvoiceItem {
                    description: &details.description,
                    quantity: 1,
                    price_cents: details.amount.cents()?,
                }],
                payer: InvoicePayer {
                    cpf_cnpj: details.payer.document_digits(),
                    name: &details.payer.name,
                    email: &details.payer.email,
                },
                payable_with: ["bank_slip", "pix"],
            };
            let invoice: InvoiceResponse = self
                .http
                .post_json("/v1/invoices", &self.auth, &body, &[("Idempotency-Key", key.as_str())])
                .await?;

            let instrument = PaymentInstrument::new(serde_json::json!({
                "secure_url": invoice.secure_url,
                "digitable_line": invoice.bank_slip.as_ref().and_then(|b| b.digitable_line.clone()),
                "barcode": invoice.bank_slip.as_ref().and_then(|b| b.barcode.clone()),
                "pix_qrcode_text": invoice.pix.as_ref().and_then(|p| p.qrcode_text.clone()),
            }));
            Ok(IssuedCharge {
                reference: ProviderReference::new(invoice.id)?,
                instrument,
            })
        })
    }

    fn fetch_status<'a>(
        &'a self,
        reference: &'a ProviderReference,
    ) -> ProviderFuture<'a, FetchedStatus> {
        Box::pin(async move {
            let invoice: InvoiceResponse = self
                .http
                .get_json(&format!("/v1/invoices/{}", reference.as_str()), &self.auth)
                .await?;
            Ok(FetchedStatus {
                paid_amount: cents_to_money(invoice.paid_cents)?,
                paid_at: parse_timestamp(invoice.paid_at.as_deref()),
                native_status: invoice.status,
            })
        })
    }

    fn cancel<'a>(&'a self, reference: &'a ProviderReference) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.http
                .send_empty(
                    reqwest::Method::PUT,
                    &format!("/v1/invoices/{}/cancel", reference.as_str()),
                    &self.auth,
                    None,
                )
                .await
        })
    }
}

pub fn parse_webhook(body: &[u8]) -> Result<Vec<WebhookNotification>, ChargeError> {
    let callback: Callback =
        serde_json::from_slice(body).map_err(|e| unparseable("card invoice", e))?;
    tracing::debug!(
        event_id = %callback.id,
        event = callback.event.as_deref().unwrap_or("unknown"),
        "card invoice callback"
    );
    Ok(vec![WebhookNotification {
        event_id: EventId::new(callback.id)?,
        reference: ProviderReference::new(callback.data.id)?,
        paid_amount: cents_to_money(callback.data.paid_cents)?,
        paid_at: parse_timestamp(callback.data.paid_at.as_deref()),
        native_status: callback.data.status,
    }])
}
