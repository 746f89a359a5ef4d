//! Domain model for session/event synchronisation: sessions, their typed
//! message logs, the phase machine, and the typed inbound event vocabulary.

pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod log;
pub mod messages;
pub mod phase;
pub mod session;

pub use context::ContextState;
pub use errors::{LogError, PhaseError, StreamError};
pub use events::StreamEvent;
pub use ids::{MessageId, SessionId};
pub use log::MessageLog;
pub use messages::{Message, MessagePayload, Role, SourceEntry, SourceRegistry, TailPatch};
pub use phase::SessionPhase;
pub use session::{Session, SessionFamily, SessionsState};
