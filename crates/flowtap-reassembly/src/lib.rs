//! flowtap reassembly - flow demultiplexing and TCP stream reassembly
//!
//! Segments are keyed by a direction-independent [`FlowKey`](flowtap_core::FlowKey),
//! reordered per direction, and handed to one decoder per direction as a
//! contiguous byte stream.

pub mod engine;
pub mod flow;
pub mod half;

pub use engine::{ReassemblyConfig, ReassemblyEngine};
pub use flow::resolve;
pub use half::{Delivery, HalfStream, SegmentOutcome};
