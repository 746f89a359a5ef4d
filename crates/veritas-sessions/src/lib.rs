//! The session registry and how stream events are folded into it.

pub mod error;
pub mod persister;
pub mod projection;
pub mod registry;

pub use error::RegistryError;
pub use persister::{BackgroundPersister, StatePersister};
pub use projection::{project, LogOp, Projection, ProjectionConfig};
pub use registry::SessionRegistry;
