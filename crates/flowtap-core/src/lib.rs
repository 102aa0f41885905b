//! flowtap core - event types, plugin traits, publisher and configuration
//!
//! This crate provides the foundational types shared by every pipeline stage:
//!
//! - **Events**: flow identities, classified TCP segments and decoded HTTP messages
//! - **Plugins**: trait seams for stream decoders and event sinks
//! - **Publisher**: the ordered event channel with an explicit overflow policy
//! - **Config**: TOML configuration discovery, overrides and validation
//! - **Metrics**: lock-free pipeline counters

pub mod config;
pub mod events;
pub mod metrics;
pub mod plugins;
pub mod publisher;

// Re-export commonly used types
pub use events::{
    BodyLength, Direction, FlowKey, Header, HeaderMap, HttpMessageEvent, MessageKind, Protocol,
    StartLine, TcpFlags, TcpSegment,
};
pub use metrics::{create_metrics, MetricsCollector, SharedMetrics};
pub use plugins::{
    DecoderFactory, EndReason, EventSink, PluginError, PluginInfo, PluginResult, StreamDecoder,
};
pub use publisher::{EventPublisher, EventStream, OverflowPolicy, PublishError, SharedEvent};
