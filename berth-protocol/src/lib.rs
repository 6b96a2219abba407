//! Wire protocol shared by the berth daemon and its front-ends.
//!
//! Frames are length-prefixed JSON over a unix domain socket. Requests are
//! multiplexed with an envelope id so a single connection can have several
//! requests in flight.

pub mod client;
pub mod errors;
pub mod protocol;
pub mod server;
