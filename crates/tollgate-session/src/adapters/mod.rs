//! Built-in implementations of the session layer's collaborator traits.

pub mod access;
pub mod handler;
pub mod local;

pub use access::{NoopAccessController, RecordingAccessController};
pub use handler::AcceptAllHandler;
pub use local::{LocalChannelClient, LocalChannelHub};
