//! Core kernel for the TAIA agent federation.
//!
//! The kernel wires the record store, the serialization bridge, the agent
//! registry and the task bus together:
//! - **Registry**: agents, skills, permission grants, agent tokens
//! - **Task bus**: delegation, batches, worker loops, the quality gate,
//!   cancellation and crash recovery
//! - **Approvals**: human-in-the-loop decisions gating critical work

pub mod approval;
pub mod bus;
pub mod config;
pub mod error;
pub mod kernel;
pub mod orchestration;
pub mod registry;
pub mod supervisor;
pub mod worker;

pub use kernel::{BootOptions, TaiaKernel};
