//! Shared types, error taxonomy, and tenant-scoped store for the
//! multi-tenant RouterOS monitoring backend.

pub mod db;
pub mod error;
pub mod history;
pub mod store;
pub mod types;

pub use db::Database;
pub use error::{Error, Result};
pub use store::Store;
pub use types::*;
