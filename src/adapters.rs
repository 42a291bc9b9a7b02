pub mod api_errors;
pub mod boleto;
pub mod card_invoice;
pub mod circuit_breaker;
pub mod convert;
pub mod http_client;
pub mod registry;
pub mod retry;
pub mod signature;
pub mod token_cache;
pub mod unified_checkout;
pub mod wallet;
pub mod webhook;
