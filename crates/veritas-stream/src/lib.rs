//! Live event subscriptions: framing, decoding, the HTTP transports and the
//! single-subscription [`EventStreamClient`].

pub mod client;
pub mod decode;
pub mod deep;
pub mod frame;
pub mod transport;

pub use client::EventStreamClient;
pub use decode::{decode_frame, DecodeError};
pub use deep::{DeepResearchRequest, DeepResearchSource, ResearchMode};
pub use frame::{FrameSplitter, Framing};
pub use transport::{BackendUrl, EventSource, FrameReader, FrameStream, HttpEventSource};
