use crate::error::TransportError;
use bytes::Bytes;
use http::Response;

/// Inbound events of an HTTP/2 connection, as seen by the
/// [`FrameListener`](super::FrameListener).
///
/// `h2` owns the frame layer; the reader tasks translate what it surfaces
/// for each stream into these.
#[derive(Debug)]
pub enum H2Frame {
    Headers {
        stream_id: u32,
        head: Response<()>,
        end_of_stream: bool,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        end_of_stream: bool,
    },
    RstStream {
        stream_id: u32,
        error_code: u32,
    },
    /// The peer sent `GOAWAY`; `stream_id` is a stream it will not process.
    GoAway {
        stream_id: u32,
        error_code: u32,
    },
    /// A local or transport failure on one stream.
    StreamError {
        stream_id: u32,
        error: anyhow::Error,
    },
}

impl H2Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            H2Frame::Headers { stream_id, .. }
            | H2Frame::Data { stream_id, .. }
            | H2Frame::RstStream { stream_id, .. }
            | H2Frame::GoAway { stream_id, .. }
            | H2Frame::StreamError { stream_id, .. } => *stream_id,
        }
    }
}

/// Translates a stream error surfaced by `h2`.
pub(crate) fn stream_failure(stream_id: u32, error: h2::Error) -> H2Frame {
    match error.reason() {
        Some(reason) if error.is_reset() && error.is_remote() => H2Frame::RstStream {
            stream_id,
            error_code: reason.into(),
        },
        Some(reason) if error.is_go_away() && error.is_remote() => H2Frame::GoAway {
            stream_id,
            error_code: reason.into(),
        },
        _ => H2Frame::StreamError {
            stream_id,
            error: TransportError::Processing(error.into()).into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locally_raised_reason_is_a_stream_error() {
        let error = h2::Error::from(h2::Reason::CANCEL);
        assert!(matches!(
            stream_failure(3, error),
            H2Frame::StreamError { stream_id: 3, .. }
        ));
    }
}
