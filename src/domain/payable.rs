use {
    super::charge::{Charge, ChargeStatus},
    super::id::{ChargeId, EstablishmentId},
    super::money::Money,
    chrono::{DateTime, NaiveDate, Utc},
    serde::Serialize,
    uuid::Uuid,
};

/// Ledger record derived once from an issued charge. Downstream accounting
/// reads it; only the status mirror moves afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct PayableAccount {
    pub id: Uuid,
    pub establishment_id: EstablishmentId,
    pub charge_id: ChargeId,
    pub amount: Money,
    pub due_date: NaiveDate,
    pub status: ChargeStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayableAccount {
    pub id: Uuid,
    pub establishment_id: EstablishmentId,
    pub charge_id: ChargeId,
    pub amount: Money,
    pub due_date: NaiveDate,
}

impl NewPayableAccount {
    pub fn for_charge(charge: &Charge) -> Self {
        Self {
            id: Uuid::now_v7(),
            establishment_id: charge.establishment_id(),
            charge_id: charge.id(),
            amount: charge.fee_amount(),
            due_date: charge.due_date(),
        }
    }
}
