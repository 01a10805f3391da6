//! Typed failure kinds.
//!
//! Plumbing returns [`anyhow::Result`]; the kinds below travel inside the
//! [`anyhow::Error`] handed to
//! [`ResponseHandler::exception_occurred`](crate::ResponseHandler::exception_occurred),
//! so a handler can `downcast_ref` to react to a specific one.

use crate::BoxError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to acquire a connection")]
    AcquireFailed(#[source] BoxError),

    #[error("failed to write the request")]
    WriteFailed(#[source] BoxError),

    #[error("failed to process the response")]
    Processing(#[source] BoxError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request aborted")]
    Aborted,

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("timed out after {0:?} waiting for a connection")]
    AcquireTimeout(Duration),

    #[error("too many outstanding acquire operations (limit {0})")]
    TooManyPendingAcquires(usize),

    #[error("{0}")]
    Protocol(String),
}

/// Returns the RFC 9113 name of an HTTP/2 error code.
pub fn error_code_name(code: u32) -> &'static str {
    match code {
        0x0 => "NO_ERROR",
        0x1 => "PROTOCOL_ERROR",
        0x2 => "INTERNAL_ERROR",
        0x3 => "FLOW_CONTROL_ERROR",
        0x4 => "SETTINGS_TIMEOUT",
        0x5 => "STREAM_CLOSED",
        0x6 => "FRAME_SIZE_ERROR",
        0x7 => "REFUSED_STREAM",
        0x8 => "CANCEL",
        0x9 => "COMPRESSION_ERROR",
        0xa => "CONNECT_ERROR",
        0xb => "ENHANCE_YOUR_CALM",
        0xc => "INADEQUATE_SECURITY",
        0xd => "HTTP_1_1_REQUIRED",
        _ => "UNKNOWN",
    }
}

/// The peer reset a stream with `RST_STREAM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub struct StreamReset {
    pub stream_id: u32,
    pub code: u32,
}

impl StreamReset {
    pub fn new(stream_id: u32, code: u32) -> Self {
        Self { stream_id, code }
    }

    pub fn name(&self) -> &'static str {
        error_code_name(self.code)
    }
}

impl fmt::Display for StreamReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection reset. Error - {}({})", self.name(), self.code)
    }
}

/// The peer sent `GOAWAY` and will not process the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub struct GoAwayError {
    pub stream_id: u32,
    pub code: u32,
}

impl GoAwayError {
    pub fn new(stream_id: u32, code: u32) -> Self {
        Self { stream_id, code }
    }

    pub fn name(&self) -> &'static str {
        error_code_name(self.code)
    }
}

impl fmt::Display for GoAwayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection is going away; stream {} was not processed. Error - {}({})",
            self.stream_id,
            self.name(),
            self.code
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_display_names_the_code() {
        let reset = StreamReset::new(3, 8);
        assert_eq!(reset.to_string(), "Connection reset. Error - CANCEL(8)");
        assert_eq!(StreamReset::new(1, 0x42).name(), "UNKNOWN");
    }

    #[test]
    fn typed_kinds_survive_anyhow() {
        let error = anyhow::Error::new(StreamReset::new(5, 7));
        assert_eq!(error.downcast_ref::<StreamReset>().map(|r| r.code), Some(7));

        let error = anyhow::Error::new(TransportError::AcquireTimeout(Duration::from_millis(5)));
        assert!(matches!(
            error.downcast_ref::<TransportError>(),
            Some(TransportError::AcquireTimeout(_))
        ));
    }
}
