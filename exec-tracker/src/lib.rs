pub mod activity;
pub mod buffer;
pub mod collector;
pub mod error;
pub mod event;
pub mod proctree;
pub mod server;
pub mod settings;
pub mod sink;
pub mod store;

pub use collector::{Batch, Handle, attach};
pub use error::{AttachError, DecodeError, PollError};
pub use event::Event;
