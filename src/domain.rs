pub mod audit;
pub mod charge;
pub mod credential;
pub mod error;
pub mod id;
pub mod money;
pub mod payable;
pub mod provider;
pub mod status_map;
