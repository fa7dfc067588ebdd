//! Configuration module
//!
//! CLI settings plus the engine wiring shared by every command.

use anyhow::{Context, Result};
use promotion_engine::repository::Repositories;
use promotion_engine::service::{Coordinator, Dispatcher};
use promotion_engine::db;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine settings resolved from the environment and flags
    pub engine: promotion_engine::Config,
    /// Print JSON instead of tables
    pub json: bool,
}

impl Config {
    /// Connects to the database and builds the dispatcher
    pub async fn connect(&self) -> Result<Dispatcher> {
        tracing::debug!("Connecting to database...");

        let pool = db::create_pool(&self.engine)
            .await
            .context("Failed to create database pool")?;

        if self.engine.run_migrations {
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
        }

        let coordinator = Coordinator::new(Repositories::postgres(pool));
        Ok(Dispatcher::from_config(coordinator, &self.engine))
    }
}
