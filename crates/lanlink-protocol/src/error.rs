//! Error types for the protocol layer.
//!
//! Every decoding failure is fatal for the connection that produced it:
//! once a length prefix or compressed body is wrong there is no way to find
//! the start of the next frame in a TCP stream.

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Compressing an outgoing frame failed.
    #[error("encode failed: {0}")]
    Encode(#[source] std::io::Error),

    /// The bytes do not form a valid frame: the length prefix runs past
    /// the buffer, the body does not decompress, or the decompressed body
    /// does not match the message layout.
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    /// A frame is larger than the configured ceiling.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Size claimed by the frame.
        size: u64,
        /// Configured maximum.
        max: u32,
    },
}

impl ProtocolError {
    /// Returns `true` if the error means the stream can no longer be
    /// trusted and the connection must be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::CorruptFrame(_) | ProtocolError::FrameTooLarge { .. }
        )
    }
}
