//! Payment lifecycle and settlement engine for a property-booking marketplace.
//!
//! Guests pay through mobile-money push collections; cancellations are
//! refunded by tier and owners are paid their share through disbursements.
//! Every attempt is an intent in the ledger, resolved by gateway callbacks or
//! by the timeout sweep.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
