use {
    super::rows::CredentialRow,
    crate::domain::{
        credential::{GatewayCredential, NewGatewayCredential},
        error::ChargeError,
        id::EstablishmentId,
        provider::ProviderType,
    },
    chrono::Utc,
    sqlx::PgPool,
};

pub async fn active(
    pool: &PgPool,
    establishment: EstablishmentId,
    provider: ProviderType,
) -> Result<GatewayCredential, ChargeError> {
    let row = sqlx::query_as::<_, CredentialRow>(
        r#"
        SELECT id, establishment_id, provider_type, secret, base_url, active, expires_at, created_at
        FROM gateway_credentials
        WHERE establishment_id = $1 AND provider_type = $2 AND active
        "#,
    )
    .bind(establishment.get())
    .bind(provider.as_str())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| {
        ChargeError::Configuration(format!(
            "no active {provider} credential for establishment {establishment}"
        ))
    })?;

    let credential = GatewayCredential::try_from(row)?;
    credential.ensure_usable(Utc::now())?;
    Ok(credential)
}

/// Rotation: the old row is deactivated before the new one is inserted so the
/// partial unique index never sees two active rows.
pub async fn activate(
    pool: &PgPool,
    credential: NewGatewayCredential,
) -> Result<GatewayCredential, ChargeError> {
    let credential = credential.into_active(Utc::now());
    let secret = serde_json::to_value(&credential.secret)?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        UPDATE gateway_credentials
        SET active = false
        WHERE establishment_id = $1 AND provider_type = $2 AND active
        "#,
    )
    .bind(credential.establishment_id.get())
    .bind(credential.provider_type.as_str())
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO gateway_credentials
            (id, establishment_id, provider_type, secret, base_url, active, expires_at, created_at)
        VALUES ($1, $2, $3, $4, $5, true, $6, $7)
        "#,
    )
    .bind(credential.id)
    .bind(credential.establishment_id.get())
    .bind(credential.provider_type.as_str())
    .bind(&secret)
    .bind(credential.base_url.as_deref())
    .bind(credential.expires_at)
    .bind(credential.created_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(
        establishment_id = %credential.establishment_id,
        provider = %credential.provider_type,
        kind = credential.secret.kind(),
        "gateway credential activated"
    );
    Ok(credential)
}

pub async fn active_count(pool: &PgPool) -> Result<i64, ChargeError> {
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM gateway_credentials WHERE active")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
