//! Core types for the TAIA agent federation.
//!
//! This crate defines the shared data model used by the record store, the
//! serialization bridge and the kernel (registry + task bus). It contains no
//! business logic.

pub mod agent;
pub mod approval;
pub mod config;
pub mod error;
pub mod finding;
pub mod skill;
pub mod task;
