//! Core domain model, configuration, and crypto primitives for the Agnox
//! producer. Everything here is IO-free; the store, cache, and HTTP layers
//! build on these types.

pub mod config;
pub mod crypto;
pub mod report_token;
pub mod types;
