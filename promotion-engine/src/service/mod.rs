//! Service layer
//!
//! Business logic lives here; repositories only move data.

mod coordinator;
mod dispatcher;
mod queries;

#[cfg(test)]
mod fixtures;

pub use coordinator::Coordinator;
pub use dispatcher::Dispatcher;
