//! Building blocks shared by the harbor session and directory tiers.

pub mod api;
pub mod broadcast;
pub mod error;
pub mod health;
pub mod ids;
pub mod link;
pub mod mandatory;
pub mod metrics;
pub mod pool;
pub mod session;
pub mod startup;
pub mod telemetry;

pub use error::ControlError;
pub use ids::IdAllocator;
