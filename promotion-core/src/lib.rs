//! Promotion Core
//!
//! Core types and abstractions for the artifact promotion engine.
//!
//! This crate contains:
//! - Domain types: workflow graphs, artifacts, promotion requests, policies, approvals
//! - DTOs: request and response shapes for the promote/approve/cancel action surface
//!
//! Nothing here performs I/O. Persistence and orchestration live in `promotion-engine`.

pub mod domain;
pub mod dto;
