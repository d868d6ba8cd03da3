#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod auth;
pub mod backend;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod cursor;
pub mod error;
pub mod join;
pub mod ledger;
pub mod session;
pub mod storage;
pub mod toggle;
pub mod token;
pub mod view;

#[cfg(test)]
pub(crate) mod test_support;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
pub use error::SyncError;
