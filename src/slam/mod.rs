//! The SLAM session: orchestrator, configuration and event signals.

pub mod config;
pub mod events;
pub mod stereo_slam;

pub use config::SlamConfig;
pub use events::Signal;
pub use stereo_slam::{SlamEvents, StereoSlam};
