//! Web API module for the blotter application.

pub mod error;
pub mod routes;
pub mod status;
pub mod trigger;

pub use routes::*;
