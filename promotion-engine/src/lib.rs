//! Promotion Engine
//!
//! Governs the movement of build artifacts across the environments of a
//! deployment workflow.
//!
//! Layers:
//! - `repository`: store traits with Postgres and in-memory adapters
//! - `service`: the promotion coordinator, the action dispatcher and read queries
//! - `config` / `db`: environment configuration, connection pool and migrations

pub mod config;
pub mod db;
pub mod error;
pub mod repository;
pub mod service;

pub use config::Config;
pub use error::{PromotionError, StoreError};
