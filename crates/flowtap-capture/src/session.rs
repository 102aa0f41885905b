//! Capture controller
//!
//! One session pairs a frame source with a reassembly engine. A blocking
//! reader drains the source into a bounded frame channel; the controller task
//! owns the flow table and runs ingestion, the idle flush timer and shutdown
//! as arms of a single `select!`, so nothing about a flow is shared between
//! threads.

use crate::classify::classify;
use crate::pcap_source::PcapSource;
use crate::source::{Frame, FrameSource, Next};
use crate::{CaptureError, SessionConfig, SourceSpec};
use flowtap_core::{DecoderFactory, EventPublisher, HttpMessageEvent, PublishError, SharedMetrics};
use flowtap_reassembly::{resolve, ReassemblyEngine};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// How a session finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The source ran out of frames
    EndOfTrace,
    /// Shutdown was signalled; in-flight flows were discarded
    Cancelled,
    /// The event consumer went away
    ConsumerGone,
}

/// Drives one capture session
pub struct CaptureController {
    config: SessionConfig,
    source: Box<dyn FrameSource>,
    engine: ReassemblyEngine,
    publisher: EventPublisher,
    metrics: SharedMetrics,
}

impl CaptureController {
    /// Open the configured interface or trace file.
    ///
    /// Every session-level failure surfaces here, before any frame is read.
    pub fn open(
        config: SessionConfig,
        factory: Arc<dyn DecoderFactory>,
        publisher: EventPublisher,
        metrics: SharedMetrics,
    ) -> Result<Self, CaptureError> {
        config.filter.validate()?;

        let source: Box<dyn FrameSource> = match &config.source {
            Some(SourceSpec::Interface(name)) => Box::new(PcapSource::open_live(
                name,
                &config.live,
                &config.filter,
            )?),
            Some(SourceSpec::File(path)) => {
                Box::new(PcapSource::open_file(path, &config.filter)?)
            }
            None => return Err(CaptureError::NoSource),
        };

        Ok(Self::with_source(config, source, factory, publisher, metrics))
    }

    /// Use an already opened source; `config.source` and the filter are ignored
    pub fn with_source(
        config: SessionConfig,
        source: Box<dyn FrameSource>,
        factory: Arc<dyn DecoderFactory>,
        publisher: EventPublisher,
        metrics: SharedMetrics,
    ) -> Self {
        let engine = ReassemblyEngine::new(config.reassembly.clone(), factory, metrics.clone());
        Self {
            config,
            source,
            engine,
            publisher,
            metrics,
        }
    }

    /// Run until the source is exhausted, shutdown is signalled or the
    /// consumer goes away.
    ///
    /// A closed shutdown channel only disables cancellation.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> SessionEnd {
        let Self {
            config,
            source,
            mut engine,
            publisher,
            metrics,
        } = self;

        info!("Capture session started on {}", source.describe());

        let (tx, mut rx) = mpsc::channel::<Frame>(config.frame_buffer.max(1));
        let reader_metrics = metrics.clone();
        let reader = tokio::task::spawn_blocking(move || read_frames(source, tx, reader_metrics));

        let mut ticker = tokio::time::interval(config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let mut cancellable = true;
        let mut events: Vec<HttpMessageEvent> = Vec::new();

        let end = loop {
            tokio::select! {
                biased;

                signal = shutdown.recv(), if cancellable => {
                    if cancels(signal, &mut cancellable) {
                        break SessionEnd::Cancelled;
                    }
                },

                frame = rx.recv() => match frame {
                    Some(frame) => {
                        ingest_frame(&mut engine, frame, &metrics, &mut events);
                        if let Err(end) =
                            publish_all(&publisher, &mut events, &mut shutdown, &mut cancellable).await
                        {
                            break end;
                        }
                    }
                    None => {
                        if config.flush_on_end_of_trace {
                            let flushed = engine.flush_all(&mut events);
                            debug!("End of trace, flushed {} flows", flushed);
                        } else {
                            engine.clear();
                        }
                        if let Err(end) =
                            publish_all(&publisher, &mut events, &mut shutdown, &mut cancellable).await
                        {
                            break end;
                        }
                        break SessionEnd::EndOfTrace;
                    }
                },

                _ = ticker.tick() => {
                    if let Some(latest) = engine.latest_timestamp() {
                        let threshold = latest - engine.config().idle_window;
                        let flushed = engine.flush_older_than(threshold, &mut events);
                        if flushed > 0 {
                            debug!("Idle flush removed {} flows ({} still tracked)", flushed, engine.flow_count());
                        }
                        if let Err(end) =
                            publish_all(&publisher, &mut events, &mut shutdown, &mut cancellable).await
                        {
                            break end;
                        }
                    }
                }
            }
        };

        if end == SessionEnd::Cancelled {
            engine.clear();
        }

        // The reader stops at its next frame or timeout once the channel is gone
        drop(rx);
        if end == SessionEnd::EndOfTrace {
            if let Err(e) = reader.await {
                warn!("Capture reader task failed: {}", e);
            }
        }
        if end == SessionEnd::ConsumerGone {
            warn!("Event consumer closed, stopping capture");
        }

        info!(
            "Capture session ended ({:?}): {} frames, {} segments, {} flows created",
            end,
            metrics.capture.frames_seen.load(Ordering::Relaxed),
            metrics.reassembly.segments.load(Ordering::Relaxed),
            metrics.reassembly.flows_created.load(Ordering::Relaxed),
        );
        end
    }
}

/// Blocking loop on the reader thread
fn read_frames(mut source: Box<dyn FrameSource>, tx: mpsc::Sender<Frame>, metrics: SharedMetrics) {
    loop {
        match source.next_frame() {
            Ok(Next::Frame(frame)) => {
                if tx.blocking_send(frame).is_err() {
                    debug!("Frame channel closed, reader stopping");
                    return;
                }
            }
            Ok(Next::Timeout) => {
                if tx.is_closed() {
                    return;
                }
            }
            Ok(Next::End) => {
                debug!("{} exhausted", source.describe());
                return;
            }
            Err(e) => {
                metrics.capture.read_errors.fetch_add(1, Ordering::Relaxed);
                error!("Reading from {} failed: {}", source.describe(), e);
                return;
            }
        }
    }
}

fn ingest_frame(
    engine: &mut ReassemblyEngine,
    frame: Frame,
    metrics: &SharedMetrics,
    out: &mut Vec<HttpMessageEvent>,
) {
    metrics.capture.frames_seen.fetch_add(1, Ordering::Relaxed);
    metrics
        .capture
        .bytes_captured
        .fetch_add(frame.data.len() as u64, Ordering::Relaxed);

    match classify(&frame) {
        Some(segment) => {
            let (key, direction) = resolve(&segment);
            engine.ingest(segment, key, direction, out);
        }
        None => {
            metrics.capture.frames_skipped.fetch_add(1, Ordering::Relaxed);
            trace!("Skipped {}-byte frame ({:?})", frame.data.len(), frame.link_type);
        }
    }
}

/// Whether a shutdown receive result cancels the session
fn cancels(signal: Result<(), RecvError>, cancellable: &mut bool) -> bool {
    match signal {
        Ok(()) | Err(RecvError::Lagged(_)) => {
            info!("Capture shutdown signal received");
            true
        }
        Err(RecvError::Closed) => {
            debug!("Shutdown channel closed, session is no longer cancellable");
            *cancellable = false;
            false
        }
    }
}

/// Publish queued events in order.
///
/// A publish blocked on a full channel still observes shutdown; events not
/// yet published are then discarded.
async fn publish_all(
    publisher: &EventPublisher,
    events: &mut Vec<HttpMessageEvent>,
    shutdown: &mut broadcast::Receiver<()>,
    cancellable: &mut bool,
) -> Result<(), SessionEnd> {
    for event in events.drain(..) {
        let publish = publisher.publish(event);
        tokio::pin!(publish);
        loop {
            tokio::select! {
                biased;

                signal = shutdown.recv(), if *cancellable => {
                    if cancels(signal, cancellable) {
                        return Err(SessionEnd::Cancelled);
                    }
                },

                result = &mut publish => match result {
                    Ok(()) => break,
                    Err(PublishError::Closed) => return Err(SessionEnd::ConsumerGone),
                },
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{LinkType, MemorySource};
    use crate::synthetic::{Conversation, Side};
    use chrono::{DateTime, Duration, Utc};
    use flowtap_core::publisher::channel;
    use flowtap_core::{create_metrics, EventStream, OverflowPolicy};
    use flowtap_decode::{DecoderLimits, HttpDecoderFactory};
    use std::time::Duration as StdDuration;

    fn controller(
        config: SessionConfig,
        source: Box<dyn FrameSource>,
    ) -> (CaptureController, EventStream, SharedMetrics) {
        let metrics = create_metrics();
        let factory = Arc::new(HttpDecoderFactory::new(
            DecoderLimits::default(),
            metrics.clone(),
        ));
        let (publisher, stream) = channel(64, OverflowPolicy::Block, metrics.clone());
        let controller =
            CaptureController::with_source(config, source, factory, publisher, metrics.clone());
        (controller, stream, metrics)
    }

    fn start() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::days(20_000)
    }

    fn get_request(port: u16, at: DateTime<Utc>) -> Vec<Frame> {
        let mut conv = Conversation::new(
            ([10, 0, 0, 1], port).into(),
            ([10, 0, 0, 2], 80).into(),
            at,
        );
        conv.handshake()
            .unwrap()
            .send_data(Side::Client, b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n", 8)
            .unwrap();
        conv.into_frames()
    }

    /// Yields its frames, then reports read timeouts forever
    struct LiveLike {
        frames: std::vec::IntoIter<Frame>,
    }

    impl FrameSource for LiveLike {
        fn describe(&self) -> String {
            "live-like".into()
        }

        fn next_frame(&mut self) -> Result<Next, CaptureError> {
            match self.frames.next() {
                Some(frame) => Ok(Next::Frame(frame)),
                None => {
                    std::thread::sleep(StdDuration::from_millis(5));
                    Ok(Next::Timeout)
                }
            }
        }
    }

    #[tokio::test]
    async fn test_end_of_trace_publishes_events() {
        let source = MemorySource::new(get_request(40000, start()));
        let (controller, mut stream, metrics) =
            controller(SessionConfig::default(), Box::new(source));
        let (_tx, rx) = broadcast::channel(1);

        assert_eq!(controller.run(rx).await, SessionEnd::EndOfTrace);

        let event = stream.recv().await.unwrap();
        assert_eq!(event.method(), Some("GET"));
        assert_eq!(event.target(), Some("/x"));
        assert!(!event.truncated);
        assert!(stream.recv().await.is_none());
        assert_eq!(metrics.capture.frames_seen.load(Ordering::Relaxed), 7);
        assert_eq!(metrics.capture.frames_skipped.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_shutdown_discards_in_flight_flows() {
        let mut frames = get_request(40000, start());
        // Headers never complete
        frames.truncate(6);
        let (controller, mut stream, metrics) =
            controller(SessionConfig::default(), Box::new(MemorySource::new(frames)));
        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();

        assert_eq!(controller.run(rx).await, SessionEnd::Cancelled);
        assert!(stream.recv().await.is_none());
        assert_eq!(metrics.pipeline.truncated_events.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_closed_shutdown_channel_does_not_cancel() {
        let source = MemorySource::new(get_request(40000, start()));
        let (controller, mut stream, _) = controller(SessionConfig::default(), Box::new(source));
        let (tx, rx) = broadcast::channel::<()>(1);
        drop(tx);

        assert_eq!(controller.run(rx).await, SessionEnd::EndOfTrace);
        assert!(stream.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_end_of_trace_without_flush() {
        let mut frames = get_request(40000, start());
        frames.truncate(6);
        let config = SessionConfig {
            flush_on_end_of_trace: false,
            ..Default::default()
        };
        let (controller, mut stream, _) = controller(config, Box::new(MemorySource::new(frames)));
        let (_tx, rx) = broadcast::channel(1);

        assert_eq!(controller.run(rx).await, SessionEnd::EndOfTrace);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_consumer_gone_stops_session() {
        let source = MemorySource::new(get_request(40000, start()));
        let (controller, stream, _) = controller(SessionConfig::default(), Box::new(source));
        drop(stream);
        let (_tx, rx) = broadcast::channel(1);

        assert_eq!(controller.run(rx).await, SessionEnd::ConsumerGone);
    }

    #[tokio::test]
    async fn test_non_tcp_frames_are_skipped() {
        let junk = Frame {
            timestamp: start(),
            data: vec![0u8; 10],
            link_type: LinkType::Ethernet,
        };
        let (controller, mut stream, metrics) =
            controller(SessionConfig::default(), Box::new(MemorySource::new([junk])));
        let (_tx, rx) = broadcast::channel(1);

        assert_eq!(controller.run(rx).await, SessionEnd::EndOfTrace);
        assert!(stream.recv().await.is_none());
        assert_eq!(metrics.capture.frames_skipped.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.reassembly.segments.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_idle_flush_uses_capture_time() {
        // Flow A stalls mid-headers; flow B arrives 300s of capture time later
        let mut frames = get_request(40000, start());
        frames.truncate(6);
        let mut later = Conversation::new(
            ([10, 0, 0, 3], 41000).into(),
            ([10, 0, 0, 2], 80).into(),
            start() + Duration::seconds(300),
        );
        later.handshake().unwrap();
        frames.extend(later.into_frames());

        let config = SessionConfig {
            flush_interval: StdDuration::from_millis(20),
            ..Default::default()
        };
        let source = LiveLike {
            frames: frames.into_iter(),
        };
        let (controller, mut stream, metrics) = controller(config, Box::new(source));
        let (tx, rx) = broadcast::channel(1);
        let session = tokio::spawn(controller.run(rx));

        let event = tokio::time::timeout(StdDuration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.truncated);
        assert_eq!(event.method(), Some("GET"));
        assert_eq!(metrics.reassembly.flows_evicted.load(Ordering::Relaxed), 1);

        tx.send(()).unwrap();
        assert_eq!(session.await.unwrap(), SessionEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_publish() {
        let mut conv = Conversation::new(
            ([10, 0, 0, 1], 40000).into(),
            ([10, 0, 0, 2], 80).into(),
            start(),
        );
        conv.handshake()
            .unwrap()
            .send_data(
                Side::Client,
                b"GET /a HTTP/1.1\r\nHost: a\r\n\r\nGET /b HTTP/1.1\r\nHost: a\r\n\r\nGET /c HTTP/1.1\r\nHost: a\r\n\r\n",
                1460,
            )
            .unwrap();

        // Room for one event and nobody reading
        let metrics = create_metrics();
        let factory = Arc::new(HttpDecoderFactory::new(
            DecoderLimits::default(),
            metrics.clone(),
        ));
        let (publisher, _stream) = channel(1, OverflowPolicy::Block, metrics.clone());
        let controller = CaptureController::with_source(
            SessionConfig::default(),
            Box::new(MemorySource::new(conv.into_frames())),
            factory,
            publisher,
            metrics.clone(),
        );
        let (tx, rx) = broadcast::channel(1);
        let session = tokio::spawn(controller.run(rx));

        tokio::time::timeout(StdDuration::from_secs(5), async {
            while metrics.pipeline.events_published.load(Ordering::Relaxed) == 0 {
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tx.send(()).unwrap();

        let end = tokio::time::timeout(StdDuration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
        assert_eq!(metrics.pipeline.events_published.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_open_without_source() {
        let metrics = create_metrics();
        let factory = Arc::new(HttpDecoderFactory::new(
            DecoderLimits::default(),
            metrics.clone(),
        ));
        let (publisher, _stream) = channel(4, OverflowPolicy::Block, metrics.clone());
        let result = CaptureController::open(SessionConfig::default(), factory, publisher, metrics);
        assert!(matches!(result, Err(CaptureError::NoSource)));
    }

    #[test]
    fn test_open_rejects_bad_filter() {
        let metrics = create_metrics();
        let factory = Arc::new(HttpDecoderFactory::new(
            DecoderLimits::default(),
            metrics.clone(),
        ));
        let (publisher, _stream) = channel(4, OverflowPolicy::Block, metrics.clone());
        let config = SessionConfig {
            filter: crate::CaptureFilter::new("not a filter ("),
            source: Some(SourceSpec::File("/nonexistent.pcap".into())),
            ..Default::default()
        };
        let result = CaptureController::open(config, factory, publisher, metrics);
        assert!(matches!(result, Err(CaptureError::Filter { .. })));
    }
}
