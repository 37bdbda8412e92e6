//! portchan-engine
//!
//! A completion-port channel engine for cooperative event-loop hosts.
//! Channel families post overlapped operations against the engine's port; a
//! background worker dispatches completions under each channel's lock and
//! either wakes a host thread parked on the channel or queues the channel
//! on its owning thread's ready queue. Per-thread event-source hooks
//! ([`ready::EventSource`]) bridge the ready queue into the host's loop.

#[cfg(test)]
mod tests;

pub mod buffer;
pub mod channel;
pub mod driver;
pub mod engine;
pub mod error;
pub mod mem;
#[cfg(windows)]
pub mod net;
pub mod port;
mod queue;
pub mod ready;
pub mod stats;
pub mod thread;
mod worker;

pub use channel::{ChannelState, Directions, Interest};
pub use driver::{ChannelHandle, ThreadAction};
pub use engine::Engine;
pub use error::ChannelError;
pub use ready::{ChannelEvent, EventSource};
pub use stats::{stats, Stats};
