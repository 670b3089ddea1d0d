//! Swap and redemption transaction engine for a peer-to-peer exchange
//! marketplace. Every settlement (accepting a swap, redeeming an item for
//! points) is a single sled transaction across the affected trees.

pub mod config;
pub mod error;
pub mod identity;
pub mod item;
pub mod ledger;
pub mod notification;
pub mod redemption;
pub mod service;
pub mod store;
pub mod swap;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use error::{EngineError, ErrorClass};
pub use service::{Committed, ExchangeService, SwapResponse};
