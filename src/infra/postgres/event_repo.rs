use {
    crate::domain::{
        audit::NewWebhookEvent,
        error::ChargeError,
        id::{ChargeId, EventId},
    },
    chrono::{DateTime, Utc},
    sqlx::PgPool,
};

/// Records a webhook delivery. Returns `false` if the event id was already
/// stored, which is how duplicate deliveries are detected.
pub async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &NewWebhookEvent,
    charge_id: Option<ChargeId>,
    outcome: &str,
    applied_at: Option<DateTime<Utc>>,
) -> Result<bool, ChargeError> {
    let inserted: Option<bool> = sqlx::query_scalar(
        r#"
        INSERT INTO webhook_events
            (external_event_id, provider_type, charge_id, raw_payload, outcome, received_at, applied_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (external_event_id) DO NOTHING
        RETURNING true
        "#,
    )
    .bind(event.external_event_id.as_str())
    .bind(event.provider_type.as_str())
    .bind(charge_id.map(|id| id.as_uuid()))
    .bind(&event.raw_payload)
    .bind(outcome)
    .bind(event.received_at)
    .bind(applied_at)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(inserted.is_some())
}

pub async fn record_unmatched(pool: &PgPool, event: &NewWebhookEvent) -> Result<bool, ChargeError> {
    let mut tx = pool.begin().await?;
    let inserted = insert_event(&mut tx, event, None, "unmatched", None).await?;
    tx.commit().await?;
    Ok(inserted)
}

pub async fn event_seen(pool: &PgPool, event_id: &EventId) -> Result<bool, ChargeError> {
    let seen: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM webhook_events WHERE external_event_id = $1)",
    )
    .bind(event_id.as_str())
    .fetch_one(pool)
    .await?;
    Ok(seen)
}
