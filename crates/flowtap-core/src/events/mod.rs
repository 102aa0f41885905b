//! Event types flowing through the pipeline
//!
//! Frames are classified into [`TcpSegment`]s, grouped by [`FlowKey`], and
//! decoded into [`HttpMessageEvent`]s.

pub mod flow;
pub mod http;
pub mod packet;

pub use flow::*;
pub use http::*;
pub use packet::*;
