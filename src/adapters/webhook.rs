use {
    super::{api_errors::ApiError, boleto, card_invoice, signature, unified_checkout, wallet},
    crate::{
        AppState,
        domain::{
            error::ChargeError,
            provider::{ProviderType, WebhookNotification},
        },
    },
    axum::{
        Json, Router,
        body::Bytes,
        extract::{DefaultBodyLimit, Path, State},
        http::HeaderMap,
        routing::{get, post},
    },
    chrono::Utc,
    std::time::Duration,
    tower_http::timeout::TimeoutLayer,
};

/// Provider notifications are small; anything bigger is not one of them.
const BODY_LIMIT: usize = 64 * 1024;

pub fn parse_notifications(
    provider: ProviderType,
    body: &[u8],
) -> Result<Vec<WebhookNotification>, ChargeError> {
    match provider {
        ProviderType::Boleto => boleto::parse_webhook(body),
        ProviderType::CardInvoice => card_invoice::parse_webhook(body),
        ProviderType::UnifiedCheckout => unified_checkout::parse_webhook(body),
        ProviderType::Wallet => wallet::parse_webhook(body),
    }
}

#[tracing::instrument(
    name = "webhook",
    skip_all,
    fields(provider = %slug, event_id = tracing::field::Empty)
)]
pub async fn webhook_handler(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let provider: ProviderType = slug.parse()?;
    let received_at = Utc::now();

    signature::verify(
        provider,
        &headers,
        &body,
        state.webhook_secrets.get(provider),
        received_at,
    )?;

    let mut notifications = parse_notifications(provider, &body)?;
    if !signature::signs_body(provider) {
        for notification in &mut notifications {
            confirm_with_provider(&state, provider, notification).await?;
        }
    }
    let raw: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ChargeError::Validation(format!("webhook body is not json: {e}")))?;

    let mut results = Vec::with_capacity(notifications.len());
    for notification in &notifications {
        tracing::Span::current().record("event_id", tracing::field::display(&notification.event_id));
        let result = state
            .engine
            .ingest_webhook(provider, notification, raw.clone(), received_at)
            .await?;
        results.push(serde_json::json!({
            "event_id": notification.event_id.as_str(),
            "result": result.as_str(),
        }));
    }

    Ok(Json(serde_json::json!({ "status": "accepted", "events": results })))
}

/// Replaces the reported status with the provider's own answer. Deliveries
/// that match no charge are left as they are; they are only recorded.
async fn confirm_with_provider(
    state: &AppState,
    provider: ProviderType,
    notification: &mut WebhookNotification,
) -> Result<(), ChargeError> {
    let store = state.engine.store();
    let Some(charge) = store
        .find_by_reference(provider, &notification.reference)
        .await?
    else {
        return Ok(());
    };
    let credential = store
        .active_credential(charge.establishment_id(), provider)
        .await?;
    let adapter = state.adapters.adapter_for(&credential).await?;
    let fetched = adapter.fetch_status(&notification.reference).await?;

    if !fetched.native_status.eq_ignore_ascii_case(&notification.native_status) {
        tracing::warn!(
            charge_id = %charge.id(),
            reported = %notification.native_status,
            confirmed = %fetched.native_status,
            "notification status differs from provider"
        );
    }
    notification.native_status = fetched.native_status;
    notification.paid_amount = fetched.paid_amount;
    notification.paid_at = fetched.paid_at;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/{provider}", post(webhook_handler))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}
