use {
    super::rows::{AttemptRow, ReviewRow},
    crate::domain::{
        audit::{ReconciliationAttempt, ReviewItem},
        error::ChargeError,
        id::ChargeId,
    },
    sqlx::PgPool,
};

pub async fn insert_attempt(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    attempt: &ReconciliationAttempt,
) -> Result<(), ChargeError> {
    sqlx::query(
        r#"
        INSERT INTO reconciliation_attempts
            (id, charge_id, source, actor, outcome, from_status, to_status,
             external_event_id, detail, attempted_at, next_attempt_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(attempt.id)
    .bind(attempt.charge_id.as_uuid())
    .bind(attempt.source.as_str())
    .bind(attempt.actor.as_str())
    .bind(attempt.outcome.as_str())
    .bind(attempt.from_status.as_str())
    .bind(attempt.to_status.map(|s| s.as_str()))
    .bind(attempt.external_event_id.as_ref().map(|e| e.as_str()))
    .bind(&attempt.detail)
    .bind(attempt.attempted_at)
    .bind(attempt.next_attempt_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn insert_review(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    item: &ReviewItem,
) -> Result<(), ChargeError> {
    sqlx::query(
        r#"
        INSERT INTO review_queue (id, charge_id, reason, detail, created_at, resolved_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(item.id)
    .bind(item.charge_id.as_uuid())
    .bind(item.reason.as_str())
    .bind(&item.detail)
    .bind(item.created_at)
    .bind(item.resolved_at)
    .execute(&mut **tx)
    .await?;

    tracing::warn!(
        charge_id = %item.charge_id,
        reason = item.reason.as_str(),
        "charge queued for manual review"
    );
    Ok(())
}

pub async fn attempts_for_charge(
    pool: &PgPool,
    charge_id: ChargeId,
) -> Result<Vec<ReconciliationAttempt>, ChargeError> {
    let rows = sqlx::query_as::<_, AttemptRow>(
        r#"
        SELECT id, charge_id, source, actor, outcome, from_status, to_status,
               external_event_id, detail, attempted_at, next_attempt_at
        FROM reconciliation_attempts
        WHERE charge_id = $1
        ORDER BY attempted_at, id
        "#,
    )
    .bind(charge_id.as_uuid())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ReconciliationAttempt::try_from).collect()
}

pub async fn open_review_items(pool: &PgPool) -> Result<Vec<ReviewItem>, ChargeError> {
    let rows = sqlx::query_as::<_, ReviewRow>(
        r#"
        SELECT id, charge_id, reason, detail, created_at, resolved_at
        FROM review_queue
        WHERE resolved_at IS NULL
        ORDER BY created_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ReviewItem::try_from).collect()
}
