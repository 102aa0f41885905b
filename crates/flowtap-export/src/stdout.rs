//! Console sink

use async_trait::async_trait;
use flowtap_core::config::StdoutExportConfig;
use flowtap_core::plugins::{EventSink, PluginError, PluginInfo, PluginResult};
use flowtap_core::{BodyLength, HttpMessageEvent, StartLine};
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::Mutex;

/// Console rendering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// One human-readable line per event
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("Invalid output format: {}. Must be text or json", other)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => f.write_str("text"),
            OutputFormat::Json => f.write_str("json"),
        }
    }
}

/// Writes events to stdout, or to any writer in tests
pub struct StdoutSink {
    format: OutputFormat,
    out: Mutex<Box<dyn Write + Send>>,
}

impl StdoutSink {
    pub fn new(format: OutputFormat) -> Self {
        Self::with_writer(format, Box::new(std::io::stdout()))
    }

    pub fn with_writer(format: OutputFormat, out: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            out: Mutex::new(out),
        }
    }

    pub fn from_config(config: &StdoutExportConfig) -> PluginResult<Self> {
        let format = config
            .format
            .parse()
            .map_err(PluginError::InitializationFailed)?;
        Ok(Self::new(format))
    }
}

/// `<ts> <flow dir> <src> -> <dst> <start line> [headers body]`
pub fn render_text(event: &HttpMessageEvent) -> String {
    let line = match &event.start_line {
        StartLine::Request {
            method,
            target,
            version,
        } => format!("{} {} {}", method, target, version),
        StartLine::Response {
            version,
            status,
            reason,
        } if reason.is_empty() => format!("{} {}", version, status),
        StartLine::Response {
            version,
            status,
            reason,
        } => format!("{} {} {}", version, status, reason),
    };
    let body = match event.body {
        BodyLength::Empty => "none".to_string(),
        BodyLength::ContentLength(n) => format!("{}/{}", event.body_bytes, n),
        BodyLength::Chunked => format!("{} chunked", event.body_bytes),
        BodyLength::UntilClose => format!("{} until-close", event.body_bytes),
    };

    format!(
        "{} {} {} -> {} {} [headers={} body={}]{}",
        event.ts.format("%H:%M:%S%.6f"),
        event.direction,
        event.source,
        event.destination,
        line,
        event.headers.len(),
        body,
        if event.truncated { " TRUNCATED" } else { "" }
    )
}

impl PluginInfo for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Prints events to the console"
    }
}

#[async_trait]
impl EventSink for StdoutSink {
    async fn export(&self, event: &HttpMessageEvent) -> PluginResult<()> {
        let line = match self.format {
            OutputFormat::Text => render_text(event),
            OutputFormat::Json => serde_json::to_string(event)?,
        };

        let mut out = self
            .out
            .lock()
            .map_err(|e| PluginError::OperationFailed(format!("Lock poisoned: {}", e)))?;
        writeln!(out, "{}", line)?;
        Ok(())
    }

    async fn flush(&self) -> PluginResult<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|e| PluginError::OperationFailed(format!("Lock poisoned: {}", e)))?;
        out.flush()?;
        Ok(())
    }
}
