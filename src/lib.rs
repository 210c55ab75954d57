//! Polymarket intelligence pipeline library.
//!
//! Exposes the core modules for use by the `polyintel` and `batch_funnel`
//! binaries and by integration tests.

pub mod batch_funnel;
pub mod catalog;
pub mod clob;
pub mod config;
pub mod copy_trader;
pub mod insider_scorer;
pub mod live_feed;
pub mod models;
pub mod risk;
pub mod store;
pub mod trade_processor;
pub mod wallet_discovery;
