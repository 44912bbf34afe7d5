//! Apolo Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the Apolo rating engine. It includes:
//!
//! - Domain models (catalog entities, accounts, balances, call costs)
//! - The filter query language used by triggers and actions
//! - Storage traits shared by the store backends
//! - Unified error handling with stable error codes
//! - Application configuration

pub mod config;
pub mod constants;
pub mod error;
pub mod filter;
pub mod models;
pub mod traits;
pub mod utils;

pub use config::AppConfig;
pub use error::AppError;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
