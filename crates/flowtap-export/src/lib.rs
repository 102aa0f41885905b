//! Event sinks for flowtap
//!
//! Sinks consume the published event stream. [`drain`] is the consumer task:
//! it hands every event to every sink in publication order and flushes them
//! once the stream ends.

use flowtap_core::config::ExportSettings;
use flowtap_core::plugins::{EventSink, PluginResult};
use flowtap_core::{EventStream, SharedMetrics};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

pub mod jsonl;
pub mod stdout;

pub use jsonl::{JsonlSink, JsonlSinkConfig};
pub use stdout::{OutputFormat, StdoutSink};

/// Build the sinks enabled in `settings`
pub fn create_sinks(settings: &ExportSettings) -> PluginResult<Vec<Box<dyn EventSink>>> {
    let mut sinks: Vec<Box<dyn EventSink>> = Vec::new();

    if settings.stdout.enabled {
        sinks.push(Box::new(StdoutSink::from_config(&settings.stdout)?));
    }
    if settings.jsonl.enabled {
        sinks.push(Box::new(JsonlSink::open(JsonlSinkConfig::from(
            &settings.jsonl,
        ))?));
    }

    Ok(sinks)
}

/// Consume `stream` until every publisher is gone.
///
/// A failing sink is logged and skipped for that event; it never stops the
/// stream. Returns the number of events consumed.
pub async fn drain(
    mut stream: EventStream,
    sinks: Vec<Box<dyn EventSink>>,
    metrics: SharedMetrics,
) -> u64 {
    let names: Vec<&str> = sinks.iter().map(|s| s.name()).collect();
    info!("Exporting to: {}", names.join(", "));

    let mut consumed = 0u64;
    while let Some(event) = stream.recv().await {
        consumed += 1;
        let mut exported = false;
        for sink in &sinks {
            match sink.export(&event).await {
                Ok(()) => exported = true,
                Err(e) => warn!("Sink {} failed on event {}: {}", sink.name(), event.event_id, e),
            }
        }
        if exported {
            metrics
                .pipeline
                .events_exported
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    for sink in &sinks {
        if let Err(e) = sink.flush().await {
            warn!("Error flushing sink {}: {}", sink.name(), e);
        }
    }
    debug!("Event stream closed after {} events", consumed);
    consumed
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use flowtap_core::config::{JsonlExportConfig, StdoutExportConfig};
    use flowtap_core::plugins::{PluginError, PluginInfo};
    use flowtap_core::publisher::channel;
    use flowtap_core::{
        create_metrics, BodyLength, Direction, FlowKey, HeaderMap, HttpMessageEvent,
        OverflowPolicy, Protocol, StartLine,
    };
    use std::sync::{Arc, Mutex};

    fn flow() -> FlowKey {
        FlowKey {
            protocol: Protocol::Tcp,
            lower: "10.0.0.1:40000".parse().unwrap(),
            higher: "10.0.0.2:80".parse().unwrap(),
        }
    }

    pub(crate) fn sample_request(target: &str) -> HttpMessageEvent {
        let mut headers = HeaderMap::new();
        headers.push("Host", "example.com");
        HttpMessageEvent::new(
            flow(),
            Direction::ClientToServer,
            StartLine::Request {
                method: "GET".into(),
                target: target.into(),
                version: "HTTP/1.1".into(),
            },
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        )
        .with_headers(headers)
    }

    pub(crate) fn sample_response(status: u16) -> HttpMessageEvent {
        let mut headers = HeaderMap::new();
        headers.push("Content-Length", "10");
        HttpMessageEvent::new(
            flow(),
            Direction::ServerToClient,
            StartLine::Response {
                version: "HTTP/1.1".into(),
                status,
                reason: if status == 404 { "Not Found" } else { "OK" }.into(),
            },
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap(),
        )
        .with_headers(headers)
        .with_body(BodyLength::ContentLength(10), 3)
    }

    /// Records targets and statuses; optionally fails every export
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl PluginInfo for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn version(&self) -> &str {
            "0"
        }
    }

    #[async_trait]
    impl EventSink for Recorder {
        async fn export(&self, event: &HttpMessageEvent) -> PluginResult<()> {
            if self.fail {
                return Err(PluginError::OperationFailed("refused".into()));
            }
            let label = match event.target() {
                Some(target) => target.to_string(),
                None => event.status().unwrap_or_default().to_string(),
            };
            self.seen.lock().unwrap().push(label);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let metrics = create_metrics();
        let (publisher, stream) = channel(8, OverflowPolicy::Block, metrics.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sinks: Vec<Box<dyn EventSink>> = vec![
            Box::new(Recorder {
                seen: seen.clone(),
                fail: false,
            }),
            Box::new(Recorder {
                seen: Arc::new(Mutex::new(Vec::new())),
                fail: true,
            }),
        ];
        let task = tokio::spawn(drain(stream, sinks, metrics.clone()));

        publisher.publish(sample_request("/a")).await.unwrap();
        publisher.publish(sample_response(200)).await.unwrap();
        publisher.publish(sample_request("/b")).await.unwrap();
        drop(publisher);

        assert_eq!(task.await.unwrap(), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["/a", "200", "/b"]);
        assert_eq!(metrics.pipeline.events_exported.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_failing_sink_is_not_counted() {
        let metrics = create_metrics();
        let (publisher, stream) = channel(8, OverflowPolicy::Block, metrics.clone());
        let sinks: Vec<Box<dyn EventSink>> = vec![Box::new(Recorder {
            seen: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        })];
        let task = tokio::spawn(drain(stream, sinks, metrics.clone()));

        publisher.publish(sample_request("/a")).await.unwrap();
        drop(publisher);

        assert_eq!(task.await.unwrap(), 1);
        assert_eq!(metrics.pipeline.events_exported.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_create_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ExportSettings {
            jsonl: JsonlExportConfig {
                enabled: true,
                path: dir.path().join("out.jsonl").display().to_string(),
                ..Default::default()
            },
            stdout: StdoutExportConfig {
                enabled: false,
                format: "text".into(),
            },
        };
        let sinks = create_sinks(&settings).unwrap();
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].name(), "jsonl");

        assert_eq!(create_sinks(&ExportSettings::default()).unwrap().len(), 1);
    }
}
