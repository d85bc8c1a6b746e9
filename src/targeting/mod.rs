//! Which artifact each device should run.

mod resolver;
mod scope;

pub use resolver::{Resolution, TargetBinding, TargetingResolver};
pub use scope::{DeviceId, Scope};
