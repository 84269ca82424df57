pub mod auth;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod persistence;
pub mod provisioning;
pub mod queue;
pub mod registry;
pub mod registry_robots;
pub mod scheduler;

pub use auth::*;
pub use dispatcher::*;
pub use error::PlatformError;
pub use models::*;
pub use persistence::*;
pub use provisioning::*;
pub use queue::*;
pub use registry::*;
pub use registry_robots::*;
pub use scheduler::*;
