// Core modules
pub mod api;
pub mod autopilot;
pub mod backtest;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod models;
pub mod persistence;
pub mod reversal;

// Re-export commonly used types
pub use error::Error;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Error>;
