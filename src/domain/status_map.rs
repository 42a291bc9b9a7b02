//! The only place provider status vocabulary is interpreted. Webhook and
//! polling paths both go through [`map_status`].

use {super::charge::ChargeStatus, super::provider::ProviderType};

use super::charge::ChargeStatus::*;

const BOLETO: &[(&str, ChargeStatus)] = &[
    ("EM_PROCESSAMENTO", Submitted),
    ("A_RECEBER", AwaitingPayment),
    ("EMITIDO", AwaitingPayment),
    ("RECEBIDO", Paid),
    ("MARCADO_RECEBIDO", Paid),
    ("PAGO", Paid),
    ("ATRASADO", Overdue),
    ("VENCIDO", Overdue),
    ("CANCELADO", Canceled),
    ("EXPIRADO", Canceled),
    ("BAIXADO", Canceled),
    ("FALHA_EMISSAO", Rejected),
];

const CARD_INVOICE: &[(&str, ChargeStatus)] = &[
    ("draft", Submitted),
    ("pending", AwaitingPayment),
    ("in_analysis", AwaitingPayment),
    ("partially_paid", AwaitingPayment),
    ("paid", Paid),
    ("externally_paid", Paid),
    ("expired", Overdue),
    ("canceled", Canceled),
    ("refunded", Canceled),
    ("chargeback", Canceled),
    ("failed", Rejected),
];

const UNIFIED_CHECKOUT: &[(&str, ChargeStatus)] = &[
    ("created", Submitted),
    ("pending", AwaitingPayment),
    ("in_process", AwaitingPayment),
    ("authorized", AwaitingPayment),
    ("waiting", AwaitingPayment),
    ("approved", Paid),
    ("paid", Paid),
    ("expired", Overdue),
    ("cancelled", Canceled),
    ("canceled", Canceled),
    ("refunded", Canceled),
    ("charged_back", Canceled),
    ("rejected", Rejected),
    ("declined", Rejected),
];

const WALLET: &[(&str, ChargeStatus)] = &[
    ("created", Submitted),
    ("analysis", AwaitingPayment),
    ("paid", Paid),
    ("completed", Paid),
    ("expired", Overdue),
    ("refunded", Canceled),
    ("chargeback", Canceled),
];

fn table(provider: ProviderType) -> &'static [(&'static str, ChargeStatus)] {
    match provider {
        ProviderType::Boleto => BOLETO,
        ProviderType::CardInvoice => CARD_INVOICE,
        ProviderType::UnifiedCheckout => UNIFIED_CHECKOUT,
        ProviderType::Wallet => WALLET,
    }
}

/// Exact table lookup, case-insensitive. `None` when the provider sent
/// something we have never seen.
pub fn lookup(provider: ProviderType, native: &str) -> Option<ChargeStatus> {
    let native = native.trim();
    table(provider)
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(native))
        .map(|(_, status)| *status)
}

/// Unknown native statuses fall back to `awaiting_payment` with a warning.
pub fn map_status(provider: ProviderType, native: &str) -> ChargeStatus {
    lookup(provider, native).unwrap_or_else(|| {
        tracing::warn!(
            provider = %provider,
            native_status = native,
            "unmapped provider status, treating as awaiting_payment"
        );
        AwaitingPayment
    })
}
