//! Stream decoders for flowtap
//!
//! This crate turns reassembled TCP byte streams into HTTP message events:
//!
//! - **HttpStreamDecoder**: incremental HTTP/1.x boundary detection per flow direction
//! - **HttpDecoderFactory**: hands the reassembly engine one decoder per direction

pub mod decoder;
pub mod http;

pub use decoder::{DecoderLimits, HttpDecoderFactory, HttpStreamDecoder};

use thiserror::Error;

/// Why a stream could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("start line exceeds {0} bytes")]
    StartLineTooLong(usize),

    #[error("malformed start line: {0:?}")]
    MalformedStartLine(String),

    #[error("header block exceeds {0} bytes")]
    HeadersTooLarge(usize),

    #[error("malformed header block: {0}")]
    MalformedHeaders(#[from] httparse::Error),

    #[error("incomplete header block")]
    IncompleteHeaders,

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("malformed chunked body: {0}")]
    MalformedChunk(String),
}
