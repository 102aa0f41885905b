//! Capture layer
//!
//! Frame sources (live interface, trace file, memory), frame classification,
//! BPF filters, synthetic traffic and the capture controller that ties a
//! source to the reassembly engine and the event publisher.

use flowtap_core::config::SensorConfig;
use flowtap_reassembly::ReassemblyConfig;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod classify;
pub mod filter;
pub mod pcap_source;
pub mod session;
pub mod source;
pub mod synthetic;

pub use classify::classify;
pub use filter::CaptureFilter;
pub use pcap_source::{list_interfaces, InterfaceInfo, LiveOptions, PcapSource};
pub use session::{CaptureController, SessionEnd};
pub use source::{Frame, FrameSource, LinkType, MemorySource, Next};

/// Session-level capture failures
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("failed to open {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: pcap::Error,
    },

    #[error("invalid capture filter {expression:?}: {source}")]
    Filter {
        expression: String,
        #[source]
        source: pcap::Error,
    },

    #[error("capture read failed: {0}")]
    Read(pcap::Error),

    #[error("no capture source configured")]
    NoSource,

    #[error("synthetic frame: {0}")]
    Synthetic(String),
}

impl CaptureError {
    pub(crate) fn open(target: &str, source: pcap::Error) -> Self {
        CaptureError::Open {
            target: target.to_string(),
            source,
        }
    }
}

/// Where frames come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Interface(String),
    File(PathBuf),
}

/// Capture session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interface or trace file; required by [`CaptureController::open`]
    pub source: Option<SourceSpec>,

    pub filter: CaptureFilter,

    pub live: LiveOptions,

    /// Frames buffered between the reader thread and the controller
    pub frame_buffer: usize,

    /// Wall-clock period of the idle flush
    pub flush_interval: Duration,

    /// Force-flush every flow when the source is exhausted
    pub flush_on_end_of_trace: bool,

    pub reassembly: ReassemblyConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            source: None,
            filter: CaptureFilter::default(),
            live: LiveOptions::default(),
            frame_buffer: 4096,
            flush_interval: Duration::from_secs(60),
            flush_on_end_of_trace: true,
            reassembly: ReassemblyConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Build from the loaded sensor configuration
    pub fn from_sensor_config(config: &SensorConfig) -> Self {
        let capture = &config.capture;
        let source = match (&capture.interface, &capture.file) {
            (Some(interface), _) => Some(SourceSpec::Interface(interface.clone())),
            (None, Some(file)) => Some(SourceSpec::File(PathBuf::from(file))),
            (None, None) => None,
        };

        Self {
            source,
            filter: CaptureFilter::new(capture.filter.clone()),
            live: LiveOptions {
                promiscuous: capture.promiscuous,
                snaplen: capture.snaplen,
                read_timeout_ms: capture.read_timeout_ms,
            },
            frame_buffer: capture.frame_buffer,
            flush_interval: Duration::from_secs(capture.flush_interval_secs),
            flush_on_end_of_trace: capture.flush_on_end_of_trace,
            reassembly: ReassemblyConfig {
                idle_window: chrono::Duration::seconds(
                    config.reassembly.idle_window_secs as i64,
                ),
                max_buffered_bytes_per_direction: config
                    .reassembly
                    .max_buffered_bytes_per_direction,
                max_flows: config.reassembly.max_flows,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_from_sensor_config() {
        let mut config = SensorConfig::default();
        config.capture.file = Some("/tmp/trace.pcap".into());
        config.capture.filter = "tcp port 80".into();
        config.capture.flush_interval_secs = 5;
        config.reassembly.idle_window_secs = 30;
        config.reassembly.max_flows = 10;

        let session = SessionConfig::from_sensor_config(&config);
        assert_eq!(
            session.source,
            Some(SourceSpec::File(PathBuf::from("/tmp/trace.pcap")))
        );
        assert_eq!(session.filter.expression(), "tcp port 80");
        assert_eq!(session.flush_interval, Duration::from_secs(5));
        assert_eq!(session.reassembly.idle_window, chrono::Duration::seconds(30));
        assert_eq!(session.reassembly.max_flows, 10);
        assert!(session.flush_on_end_of_trace);
    }

    #[test]
    fn test_default_session_has_no_source() {
        let session = SessionConfig::from_sensor_config(&SensorConfig::default());
        assert!(session.source.is_none());
        assert_eq!(session.filter, CaptureFilter::default());
    }

    #[test]
    fn test_error_messages() {
        let err = CaptureError::InterfaceNotFound("eth9".into());
        assert_eq!(err.to_string(), "interface not found: eth9");
        assert_eq!(CaptureError::NoSource.to_string(), "no capture source configured");
    }
}
