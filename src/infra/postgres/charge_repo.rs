use {
    super::{
        audit_repo::{insert_attempt, insert_review},
        event_repo::insert_event,
        rows::{ChargeRow, PayableRow, charge_columns},
    },
    crate::{
        domain::{
            audit::{ReconciliationAttempt, ReviewItem},
            charge::{Charge, ChargeStatus, NewCharge},
            error::ChargeError,
            id::{ChargeId, IdempotencyKey, ProviderReference},
            payable::PayableAccount,
            provider::ProviderType,
        },
        infra::store::{
            CommitOutcome, DraftClaim, DraftOutcome, IssueRecord, PollFailure, ReconciliationCommit,
        },
    },
    chrono::{DateTime, Utc},
    sqlx::PgPool,
};

const POLLABLE: &str = "('submitted', 'awaiting_payment', 'overdue')";

async fn lock_charge(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: ChargeId,
) -> Result<Charge, ChargeError> {
    let row = sqlx::query_as::<_, ChargeRow>(concat!(
        "SELECT ",
        charge_columns!(),
        " FROM charges WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| ChargeError::NotFound(format!("charge {id}")))?;
    row.try_into()
}

/// Writes back every mutable column of a charge locked with [`lock_charge`].
async fn store_charge(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    charge: &Charge,
) -> Result<Charge, ChargeError> {
    let row = sqlx::query_as::<_, ChargeRow>(concat!(
        r#"
        UPDATE charges
        SET provider_reference_id = $2, payment_instrument = $3, status = $4,
            paid_at = $5, paid_amount = $6, attempts_count = $7, next_poll_at = $8,
            stalled = $9, version = $10, updated_at = $11, issue_lease_until = $12
        WHERE id = $1
        RETURNING "#,
        charge_columns!()
    ))
    .bind(charge.id.as_uuid())
    .bind(charge.provider_reference.as_ref().map(|r| r.as_str()))
    .bind(charge.payment_instrument.as_ref().map(|i| i.as_json()))
    .bind(charge.status.as_str())
    .bind(charge.paid_at)
    .bind(charge.paid_amount.map(|m| m.value()))
    .bind(charge.attempts_count)
    .bind(charge.next_poll_at)
    .bind(charge.stalled)
    .bind(charge.version)
    .bind(charge.updated_at)
    .bind(charge.issue_lease_until)
    .fetch_one(&mut **tx)
    .await
    .map_err(reference_conflict)?;
    row.try_into()
}

/// The partial unique index on (provider_type, provider_reference_id) firing
/// means two charges claim one provider object.
fn reference_conflict(err: sqlx::Error) -> ChargeError {
    let is_reference = err
        .as_database_error()
        .and_then(|db| db.constraint())
        .is_some_and(|c| c == "uq_charges_reference");
    if is_reference {
        ChargeError::Invariant(format!("provider reference already belongs to another charge: {err}"))
    } else {
        ChargeError::Database(err)
    }
}

pub async fn get(pool: &PgPool, id: ChargeId) -> Result<Option<Charge>, ChargeError> {
    sqlx::query_as::<_, ChargeRow>(concat!("SELECT ", charge_columns!(), " FROM charges WHERE id = $1"))
        .bind(id.as_uuid())
        .fetch_optional(pool)
        .await?
        .map(Charge::try_from)
        .transpose()
}

pub async fn find_by_reference(
    pool: &PgPool,
    provider: ProviderType,
    reference: &ProviderReference,
) -> Result<Option<Charge>, ChargeError> {
    sqlx::query_as::<_, ChargeRow>(concat!(
        "SELECT ",
        charge_columns!(),
        " FROM charges WHERE provider_type = $1 AND provider_reference_id = $2"
    ))
    .bind(provider.as_str())
    .bind(reference.as_str())
    .fetch_optional(pool)
    .await?
    .map(Charge::try_from)
    .transpose()
}

pub async fn find_by_key(pool: &PgPool, key: &IdempotencyKey) -> Result<Option<Charge>, ChargeError> {
    sqlx::query_as::<_, ChargeRow>(concat!(
        "SELECT ",
        charge_columns!(),
        " FROM charges WHERE idempotency_key = $1"
    ))
    .bind(key.as_str())
    .fetch_optional(pool)
    .await?
    .map(Charge::try_from)
    .transpose()
}

/// `ON CONFLICT DO NOTHING` on the idempotency key makes concurrent creates
/// for the same period collapse onto one row.
pub async fn insert_draft(pool: &PgPool, charge: &NewCharge) -> Result<DraftOutcome, ChargeError> {
    let inserted = sqlx::query_as::<_, ChargeRow>(concat!(
        r#"
        INSERT INTO charges
            (id, establishment_id, period_start, period_end, gross_revenue, fee_percentage,
             fee_amount, due_date, provider_type, idempotency_key, status, created_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'draft', $11)
        ON CONFLICT (idempotency_key) DO NOTHING
        RETURNING "#,
        charge_columns!()
    ))
    .bind(charge.id.as_uuid())
    .bind(charge.establishment_id.get())
    .bind(charge.period.start())
    .bind(charge.period.end())
    .bind(charge.gross_revenue.value())
    .bind(charge.fee_percentage.value())
    .bind(charge.fee_amount.value())
    .bind(charge.due_date)
    .bind(charge.provider_type.as_str())
    .bind(charge.idempotency_key.as_str())
    .bind(charge.created_by.as_str())
    .fetch_optional(pool)
    .await?;

    match inserted {
        Some(row) => Ok(DraftOutcome::Inserted(row.try_into()?)),
        None => find_by_key(pool, &charge.idempotency_key)
            .await?
            .map(DraftOutcome::Existing)
            .ok_or_else(|| {
                ChargeError::Invariant(format!(
                    "idempotency key {} conflicted but no charge holds it",
                    charge.idempotency_key
                ))
            }),
    }
}

pub async fn claim_draft(
    pool: &PgPool,
    charge_id: ChargeId,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
) -> Result<DraftClaim, ChargeError> {
    let mut tx = pool.begin().await?;
    let mut charge = lock_charge(&mut tx, charge_id).await?;
    let claim = DraftClaim::take(&mut charge, now, lease_until);
    if let DraftClaim::Claimed { charge, possibly_issued } = claim {
        let charge = store_charge(&mut tx, &charge).await?;
        tx.commit().await?;
        return Ok(DraftClaim::Claimed {
            charge,
            possibly_issued,
        });
    }
    tx.commit().await?;
    Ok(claim)
}

pub async fn release_draft(pool: &PgPool, charge_id: ChargeId, version: i64) -> Result<(), ChargeError> {
    sqlx::query(
        r#"
        UPDATE charges
        SET issue_lease_until = NULL
        WHERE id = $1 AND version = $2 AND status = 'draft'
        "#,
    )
    .bind(charge_id.as_uuid())
    .bind(version)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn finalize_issue(pool: &PgPool, record: &IssueRecord) -> Result<Charge, ChargeError> {
    let mut tx = pool.begin().await?;
    let mut charge = lock_charge(&mut tx, record.charge_id).await?;

    if !record.apply_to(&mut charge)? {
        tx.commit().await?;
        return Ok(charge);
    }
    let charge = store_charge(&mut tx, &charge).await?;

    sqlx::query(
        r#"
        INSERT INTO payable_accounts
            (id, establishment_id, charge_id, amount, due_date, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, 'submitted', $6, $6)
        ON CONFLICT (charge_id) DO NOTHING
        "#,
    )
    .bind(record.payable.id)
    .bind(record.payable.establishment_id.get())
    .bind(record.payable.charge_id.as_uuid())
    .bind(record.payable.amount.value())
    .bind(record.payable.due_date)
    .bind(record.attempt.attempted_at)
    .execute(&mut *tx)
    .await?;

    insert_attempt(&mut tx, &record.attempt).await?;
    tx.commit().await?;
    Ok(charge)
}

pub async fn reject_draft(
    pool: &PgPool,
    charge_id: ChargeId,
    attempt: &ReconciliationAttempt,
    review: &ReviewItem,
) -> Result<Charge, ChargeError> {
    let mut tx = pool.begin().await?;
    let mut charge = lock_charge(&mut tx, charge_id).await?;
    if charge.status != ChargeStatus::Draft {
        return Err(ChargeError::Invariant(format!(
            "charge {charge_id} is {}, only drafts can be rejected",
            charge.status
        )));
    }
    charge.status = ChargeStatus::Rejected;
    charge.next_poll_at = None;
    charge.issue_lease_until = None;
    charge.version += 1;
    charge.updated_at = attempt.attempted_at;
    let charge = store_charge(&mut tx, &charge).await?;

    insert_attempt(&mut tx, attempt).await?;
    insert_review(&mut tx, review).await?;
    tx.commit().await?;
    Ok(charge)
}

/// Row lock, version check, event dedup, status write, payable mirror and
/// audit rows in one transaction. Any early return rolls everything back.
pub async fn commit_reconciliation(
    pool: &PgPool,
    commit: &ReconciliationCommit,
) -> Result<CommitOutcome, ChargeError> {
    let mut tx = pool.begin().await?;

    sqlx::query("SET LOCAL lock_timeout = '5s'")
        .execute(&mut *tx)
        .await?;

    let mut charge = lock_charge(&mut tx, commit.charge_id).await?;
    if charge.version != commit.expected_version {
        return Ok(CommitOutcome::VersionConflict);
    }

    if let Some(event) = &commit.event {
        let inserted = insert_event(
            &mut tx,
            event,
            Some(commit.charge_id),
            commit.event_outcome(),
            commit.applied_at(),
        )
        .await?;
        if !inserted {
            return Ok(CommitOutcome::DuplicateEvent);
        }
    }

    commit.apply_to(&mut charge);
    let charge = store_charge(&mut tx, &charge).await?;

    if let Some(change) = &commit.change {
        let paid_at = (change.to == ChargeStatus::Paid)
            .then_some(change.paid_at)
            .flatten();
        sqlx::query(
            r#"
            UPDATE payable_accounts
            SET status = $2, paid_at = COALESCE($3, paid_at), updated_at = $4
            WHERE charge_id = $1
            "#,
        )
        .bind(commit.charge_id.as_uuid())
        .bind(change.to.as_str())
        .bind(paid_at)
        .bind(commit.attempt.attempted_at)
        .execute(&mut *tx)
        .await?;
    }

    insert_attempt(&mut tx, &commit.attempt).await?;
    if let Some(review) = &commit.review {
        insert_review(&mut tx, review).await?;
    }
    tx.commit().await?;
    Ok(CommitOutcome::Committed(charge))
}

/// Same row lock as [`commit_reconciliation`], so a webhook committing while
/// the fetch was in flight is seen here and the failure is dropped.
pub async fn record_poll_failure(pool: &PgPool, failure: &PollFailure) -> Result<bool, ChargeError> {
    let mut tx = pool.begin().await?;
    let mut charge = lock_charge(&mut tx, failure.charge_id).await?;
    if !failure.still_applies(&charge) {
        return Ok(false);
    }
    failure.apply_to(&mut charge);
    store_charge(&mut tx, &charge).await?;

    insert_attempt(&mut tx, &failure.attempt).await?;
    if let Some(review) = &failure.review {
        insert_review(&mut tx, review).await?;
    }
    tx.commit().await?;
    Ok(true)
}

pub async fn due_for_poll(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Charge>, ChargeError> {
    let sql = format!(
        "SELECT {} FROM charges \
         WHERE NOT stalled AND status IN {POLLABLE} \
           AND provider_reference_id IS NOT NULL AND next_poll_at <= $1 \
         ORDER BY next_poll_at \
         LIMIT $2",
        charge_columns!()
    );
    let rows = sqlx::query_as::<_, ChargeRow>(&sql)
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(Charge::try_from).collect()
}

pub async fn resume_polling(
    pool: &PgPool,
    charge_id: ChargeId,
    next_poll_at: DateTime<Utc>,
    attempt: &ReconciliationAttempt,
) -> Result<Charge, ChargeError> {
    let mut tx = pool.begin().await?;
    let mut charge = lock_charge(&mut tx, charge_id).await?;
    if charge.status.is_terminal() {
        return Err(ChargeError::Validation(format!(
            "charge {charge_id} is {}, nothing to poll",
            charge.status
        )));
    }
    charge.stalled = false;
    charge.attempts_count = 0;
    charge.next_poll_at = Some(next_poll_at);
    charge.updated_at = attempt.attempted_at;
    let charge = store_charge(&mut tx, &charge).await?;

    insert_attempt(&mut tx, attempt).await?;
    tx.commit().await?;
    Ok(charge)
}

pub async fn payable_for_charge(
    pool: &PgPool,
    charge_id: ChargeId,
) -> Result<Option<PayableAccount>, ChargeError> {
    sqlx::query_as::<_, PayableRow>(
        r#"
        SELECT id, establishment_id, charge_id, amount, due_date, status, paid_at,
               created_at, updated_at
        FROM payable_accounts
        WHERE charge_id = $1
        "#,
    )
    .bind(charge_id.as_uuid())
    .fetch_optional(pool)
    .await?
    .map(PayableAccount::try_from)
    .transpose()
}
