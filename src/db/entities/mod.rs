//! Database entities

pub mod artifact;
pub mod target_binding;

pub use artifact::Entity as Artifact;
pub use target_binding::Entity as TargetBinding;
