//! IP guard service
//!
//! Request-path rate limiting and block listing, plus periodic classification
//! of suspicious activity and auto-blocking of repeat offenders.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
