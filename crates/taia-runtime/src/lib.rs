//! Serialization bridge for the TAIA federation.
//!
//! Every mutating side effect (file writes, deletes, shell commands) is
//! funnelled through one ordered lane and recorded on a tamper-evident audit
//! chain. The bridge also verifies targets against protected zones, rejects
//! blacklisted commands, writes checkpoint markers, and escalates severe
//! security findings to a human.

pub mod audit;
pub mod bridge;
pub mod error;
pub mod lane;
