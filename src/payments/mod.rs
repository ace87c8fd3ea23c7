pub mod callback;
pub mod error;
pub mod provider;
pub mod providers;
pub mod token;
pub mod types;
pub mod utils;

pub use error::{GatewayError, GatewayResult};
pub use provider::{CollectionGateway, DisbursementGateway};
pub use providers::mpesa::MpesaGateway;
