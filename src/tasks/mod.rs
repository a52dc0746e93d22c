//! Task graph side of ingestion — materialization and sender accounts.

pub mod accounts;
pub mod materializer;
pub mod model;

pub use accounts::AccountResolver;
pub use materializer::{MaterializeResult, Materializer};
