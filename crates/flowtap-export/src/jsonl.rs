//! JSONL file sink

use async_trait::async_trait;
use flowtap_core::config::JsonlExportConfig;
use flowtap_core::plugins::{EventSink, PluginError, PluginInfo, PluginResult};
use flowtap_core::HttpMessageEvent;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;

/// JSONL sink configuration
#[derive(Debug, Clone)]
pub struct JsonlSinkConfig {
    /// Output file path
    pub path: PathBuf,

    /// Whether to append to an existing file
    pub append: bool,

    /// Pretty print JSON (one event then spans several lines)
    pub pretty: bool,

    /// Flush after each write
    pub flush_each: bool,
}

impl Default for JsonlSinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("flowtap-events.jsonl"),
            append: true,
            pretty: false,
            flush_each: true,
        }
    }
}

impl From<&JsonlExportConfig> for JsonlSinkConfig {
    fn from(config: &JsonlExportConfig) -> Self {
        Self {
            path: PathBuf::from(&config.path),
            append: config.append,
            pretty: config.pretty,
            flush_each: config.flush_each,
        }
    }
}

/// Writes one JSON object per event
pub struct JsonlSink {
    config: JsonlSinkConfig,
    writer: Mutex<BufWriter<File>>,
    events_written: AtomicU64,
}

impl JsonlSink {
    /// Open (or create) the output file
    pub fn open(config: JsonlSinkConfig) -> PluginResult<Self> {
        let file = if config.append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.path)?
        } else {
            File::create(&config.path)?
        };
        info!("JSONL sink writing to: {:?}", config.path);

        Ok(Self {
            config,
            writer: Mutex::new(BufWriter::new(file)),
            events_written: AtomicU64::new(0),
        })
    }

    pub fn events_written(&self) -> u64 {
        self.events_written.load(Ordering::Relaxed)
    }
}

impl PluginInfo for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Writes events to a JSONL file"
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    async fn export(&self, event: &HttpMessageEvent) -> PluginResult<()> {
        let json = if self.config.pretty {
            serde_json::to_string_pretty(event)?
        } else {
            serde_json::to_string(event)?
        };

        let mut w = self
            .writer
            .lock()
            .map_err(|e| PluginError::OperationFailed(format!("Lock poisoned: {}", e)))?;
        writeln!(w, "{}", json)?;
        if self.config.flush_each {
            w.flush()?;
        }

        self.events_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> PluginResult<()> {
        let mut w = self
            .writer
            .lock()
            .map_err(|e| PluginError::OperationFailed(format!("Lock poisoned: {}", e)))?;
        w.flush()?;
        Ok(())
    }
}
