//! Data Transfer Objects for the action surface
//!
//! This module contains the request and response shapes exchanged between
//! callers (the CLI, or any transport wrapping the engine) and the
//! promotion engine services.

pub mod action;
pub mod promotion;
