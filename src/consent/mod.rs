//! # Consent Flows
//!
//! The login/consent half of the connection lifecycle: step types, the
//! processor that drives flows from first step to terminal outcome, and the
//! sweeper that reaps flows whose user never came back.

pub mod cleanup;
pub mod processor;
pub mod steps;

pub use cleanup::SessionCleanupService;
pub use processor::{LoginStepService, StartFlowRequest, StartedFlow};
pub use steps::{FilledForm, Login, LoginStep, StepResult};
