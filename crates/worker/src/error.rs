use thiserror::Error;

/// Terminal errors a pipeline stage can raise. The supervisor classifies
/// them into retry-with-backoff or fatal (no auto-restart).
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// RTSP peer rejected the credentials (401/403). Fatal.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// Could not reach or open the source.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The stream died mid-flight (EOF, read timeout, TCP reset).
    #[error("stream lost: {0}")]
    StreamLost(String),
    /// The decoder choked on the bitstream.
    #[error("decode failed: {0}")]
    Decode(String),
    /// No decoder for this codec. Fatal.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    /// A file source played to its end.
    #[error("end of media")]
    EndOfMedia,
    /// The VP8 encoder failed.
    #[error("encode failed: {0}")]
    Encode(String),
    /// A downstream stage closed its bus; the pipeline instance is done.
    #[error("pipeline halted")]
    Halted,
}

impl StageError {
    /// Fatal errors close the worker; the server will not auto-restart it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Auth(_) | StageError::UnsupportedCodec(_))
    }

    /// Stable identifier used in fatal-event reports.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Auth(_) => "auth_error",
            StageError::Connect(_) => "connect_error",
            StageError::StreamLost(_) => "stream_lost",
            StageError::Decode(_) => "decode_error",
            StageError::UnsupportedCodec(_) => "unsupported_codec",
            StageError::EndOfMedia => "end_of_media",
            StageError::Encode(_) => "encode_error",
            StageError::Halted => "pipeline_halted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_codec_errors_are_fatal() {
        assert!(StageError::Auth("401".into()).is_fatal());
        assert!(StageError::UnsupportedCodec("h266".into()).is_fatal());
    }

    #[test]
    fn transient_errors_are_not_fatal() {
        assert!(!StageError::Connect("refused".into()).is_fatal());
        assert!(!StageError::StreamLost("eof".into()).is_fatal());
        assert!(!StageError::Decode("bad nal".into()).is_fatal());
        assert!(!StageError::EndOfMedia.is_fatal());
        assert!(!StageError::Encode("enc".into()).is_fatal());
    }
}
