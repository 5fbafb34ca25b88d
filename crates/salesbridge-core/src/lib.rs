//! Core types, config, and errors for salesbridge.

pub mod config;
pub mod error;
pub mod types;
