//! Core types shared across the Atelier workspace.
//!
//! This crate carries the vocabulary the rest of the system speaks:
//! identifiers, the run lifecycle state machine, the plan model produced by
//! the planner, the cross-cutting error taxonomy, and the cancellation
//! context threaded through every long-running operation.

#![deny(unsafe_code)]

pub mod ctx;
pub mod error;
pub mod ids;
pub mod plan;
pub mod run;

pub use ctx::{CancelHandle, Ctx};
pub use error::{CoreError, CoreResult};
pub use ids::{ClientId, DocumentId, JobId, OrgId, RunId, UserId, WorkerId};
pub use plan::{Plan, PlanPhase};
pub use run::{ExecuteAction, RunError, RunRecord, RunState};
