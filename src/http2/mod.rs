//! HTTP/2 multiplexing on top of the `h2` client.

mod connection;
mod frame;
mod listener;
pub mod multiplexed;

pub(crate) use connection::{Http2Handle, OpenError, handshake, prepare_request};
pub use frame::H2Frame;
pub use listener::FrameListener;
pub use multiplexed::{Http2MultiplexedPool, RecordSnapshot};
