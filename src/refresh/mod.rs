//! Data refresh: batch orchestration, the background flywheel and the
//! retrieval window calculation.

pub mod flywheel;
pub mod orchestrator;
pub mod window;

pub use flywheel::FlywheelService;
pub use orchestrator::RefreshService;
pub use window::{FetchWindowConfig, WindowInputs, fetch_lower_bound};
