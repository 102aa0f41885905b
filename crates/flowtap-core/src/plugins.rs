//! Plugin traits for pipeline stages
//!
//! The reassembly engine drives [`StreamDecoder`]s created by a
//! [`DecoderFactory`]; decoded events leave the pipeline through
//! [`EventSink`]s.

use crate::events::{Direction, FlowKey, HttpMessageEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Plugin error type
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Plugin operation failed: {0}")]
    OperationFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;

/// Basic plugin information
pub trait PluginInfo {
    /// Plugin name
    fn name(&self) -> &str;

    /// Plugin version
    fn version(&self) -> &str;

    /// Plugin description
    fn description(&self) -> &str {
        ""
    }
}

// =============================================================================
// DECODERS
// =============================================================================

/// Why a direction's byte stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// FIN observed and every byte before it delivered
    Closed,
    /// RST observed
    Reset,
    /// Forced flush of an idle or evicted flow; bytes may be missing
    Flushed,
}

/// Incremental decoder for one direction of one flow.
///
/// The engine calls these in stream order and never concurrently.
/// Decoded events are appended to `out`.
pub trait StreamDecoder: Send {
    /// Contiguous bytes following everything delivered so far.
    /// `ts` is the capture time of the segment that carried them.
    fn on_data(&mut self, data: &[u8], ts: DateTime<Utc>, out: &mut Vec<HttpMessageEvent>);

    /// Bytes are missing between the previous and the next `on_data` call.
    fn on_gap(&mut self, out: &mut Vec<HttpMessageEvent>);

    /// No further bytes will arrive.
    fn on_end(&mut self, reason: EndReason, out: &mut Vec<HttpMessageEvent>);

    /// Whether the decoder has given up on this stream
    fn is_abandoned(&self) -> bool {
        false
    }
}

/// Creates one decoder per flow direction
pub trait DecoderFactory: PluginInfo + Send + Sync {
    fn create(&self, flow: &FlowKey, direction: Direction) -> Box<dyn StreamDecoder>;
}

// =============================================================================
// SINKS
// =============================================================================

/// Event sink - consumes published events
#[async_trait]
pub trait EventSink: PluginInfo + Send + Sync {
    /// Export an event
    async fn export(&self, event: &HttpMessageEvent) -> PluginResult<()>;

    /// Flush any buffered events
    async fn flush(&self) -> PluginResult<()> {
        Ok(())
    }
}
