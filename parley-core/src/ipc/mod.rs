//! Serialisable events for presentation code.

pub mod events;

pub use events::{CallStatus, CallStatusEvent, TranscriptEvent};
