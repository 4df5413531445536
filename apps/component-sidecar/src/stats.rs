use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use sidecar_proto::{
    ComponentIdentity, SessionReport, StatsReport, EVENT_SESSION_UPDATES, EVENT_STATUS_UPDATES,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::ChannelError;
use crate::metrics;
use crate::request::{AuthenticatedClient, RequestError};

/// Where polled health comes from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self) -> Result<Option<Value>, RequestError>;
}

/// Where reports go. Implemented by the orchestrator channel.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn push(&self, event: &'static str, payload: Value) -> Result<(), ChannelError>;
}

pub struct LocalStatusSource {
    client: AuthenticatedClient,
    url: String,
}

impl LocalStatusSource {
    pub fn new(client: AuthenticatedClient, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl StatusSource for LocalStatusSource {
    async fn fetch_status(&self) -> Result<Option<Value>, RequestError> {
        self.client.get_json(&self.url).await
    }
}

struct PipelineInner {
    identity: ComponentIdentity,
    latest: Mutex<Option<StatsReport>>,
    sink: Arc<dyn ReportSink>,
    // Single writer towards the orchestrator.
    push_lock: tokio::sync::Mutex<()>,
}

/// Holds the latest known health of the component and pushes it to the
/// orchestrator, either on the reporting cadence or immediately when the
/// component calls the webhook.
#[derive(Clone)]
pub struct StatsPipeline {
    inner: Arc<PipelineInner>,
}

impl StatsPipeline {
    pub fn new(identity: ComponentIdentity, sink: Arc<dyn ReportSink>) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                identity,
                latest: Mutex::new(None),
                sink,
                push_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn latest(&self) -> Option<StatsReport> {
        self.inner.latest.lock().clone()
    }

    fn set_latest(&self, report: Option<StatsReport>) {
        *self.inner.latest.lock() = report;
    }

    /// One poll of the local status endpoint. Failures and empty bodies
    /// leave the latest report absent.
    pub async fn collect_once(&self, source: &dyn StatusSource) {
        let report = match source.fetch_status().await {
            Ok(Some(stats)) => {
                metrics::STATS_COLLECTIONS.with_label_values(&["ok"]).inc();
                Some(StatsReport::polled(
                    self.inner.identity.clone(),
                    stats,
                    Utc::now().timestamp_millis(),
                ))
            }
            Ok(None) => {
                metrics::STATS_COLLECTIONS.with_label_values(&["empty"]).inc();
                debug!("status endpoint returned no body");
                None
            }
            Err(err) => {
                metrics::STATS_COLLECTIONS.with_label_values(&["error"]).inc();
                warn!(error = %err, "failed to collect component stats");
                None
            }
        };
        self.set_latest(report);
    }

    /// Pushes the latest report, or the bare identity when nothing is
    /// known. A failed push forgets the report it tried to send, unless a
    /// collection replaced it while the push was in flight.
    pub async fn report_once(&self) {
        let _guard = self.inner.push_lock.lock().await;
        let cached = self.latest();
        let report = cached
            .clone()
            .unwrap_or_else(|| StatsReport::identity_only(self.inner.identity.clone()));
        if let Err(err) = self.emit(EVENT_STATUS_UPDATES, &report).await {
            warn!(error = %err, "failed to report component stats");
            let mut latest = self.inner.latest.lock();
            if *latest == cached {
                *latest = None;
            }
        }
    }

    /// Webhook path: store the pushed status and forward it right away.
    pub async fn publish_status(&self, status: Value) -> Result<(), ChannelError> {
        let _guard = self.inner.push_lock.lock().await;
        let report = StatsReport::pushed(
            self.inner.identity.clone(),
            status,
            Utc::now().timestamp_millis(),
        );
        self.set_latest(Some(report.clone()));
        self.emit(EVENT_STATUS_UPDATES, &report).await
    }

    /// Session updates are forwarded but never cached.
    pub async fn publish_session(&self, mut report: SessionReport) -> Result<(), ChannelError> {
        let _guard = self.inner.push_lock.lock().await;
        report.timestamp.get_or_insert_with(|| Utc::now().timestamp_millis());
        self.emit(EVENT_SESSION_UPDATES, &report).await
    }

    async fn emit<T: serde::Serialize>(
        &self,
        event: &'static str,
        payload: &T,
    ) -> Result<(), ChannelError> {
        let payload = serde_json::to_value(payload).map_err(ChannelError::Encode)?;
        let result = self.inner.sink.push(event, payload).await;
        metrics::EMITS
            .with_label_values(&[event, if result.is_ok() { "ok" } else { "error" }])
            .inc();
        result
    }

    /// Polls forever. The next poll starts `interval` after the previous
    /// one finished, so polls never overlap.
    pub fn spawn_collector(
        &self,
        source: Arc<dyn StatusSource>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            loop {
                pipeline.collect_once(source.as_ref()).await;
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Reports forever, first report after one interval.
    pub fn spawn_reporter(&self, interval: Duration) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                pipeline.report_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use sidecar_proto::{ComponentType, SessionStatus};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn identity() -> ComponentIdentity {
        ComponentIdentity {
            component_id: "jibri-1".into(),
            component_key: "k1".into(),
            component_type: ComponentType::Jibri,
            environment: "test".into(),
            region: "local".into(),
            hostname: "host-1".into(),
            group: None,
            metadata: Map::new(),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        pushes: Mutex<Vec<(&'static str, Value)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ReportSink for RecordingSink {
        async fn push(&self, event: &'static str, payload: Value) -> Result<(), ChannelError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ChannelError::NotConnected);
            }
            self.pushes.lock().push((event, payload));
            Ok(())
        }
    }

    struct FixedSource(Result<Option<Value>, ()>);

    #[async_trait]
    impl StatusSource for FixedSource {
        async fn fetch_status(&self) -> Result<Option<Value>, RequestError> {
            self.0
                .clone()
                .map_err(|_| RequestError::Protocol("boom".into()))
        }
    }

    fn pipeline() -> (StatsPipeline, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (StatsPipeline::new(identity(), sink.clone()), sink)
    }

    #[tokio::test]
    async fn failures_and_empty_bodies_clear_latest() {
        let (pipeline, _) = pipeline();
        pipeline
            .collect_once(&FixedSource(Ok(Some(json!({"busy": false})))))
            .await;
        assert!(pipeline.latest().is_some());

        pipeline.collect_once(&FixedSource(Err(()))).await;
        assert!(pipeline.latest().is_none());
        pipeline.collect_once(&FixedSource(Err(()))).await;
        assert!(pipeline.latest().is_none());

        pipeline
            .collect_once(&FixedSource(Ok(Some(json!({"busy": true})))))
            .await;
        pipeline.collect_once(&FixedSource(Ok(None))).await;
        assert!(pipeline.latest().is_none());
    }

    #[tokio::test]
    async fn absent_report_sends_identity_only() {
        let (pipeline, sink) = pipeline();
        pipeline.report_once().await;

        let pushes = sink.pushes.lock();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, EVENT_STATUS_UPDATES);
        assert_eq!(pushes[0].1, json!({"component": serde_json::to_value(identity()).unwrap()}));
    }

    #[tokio::test]
    async fn polled_report_is_pushed_with_stats() {
        let (pipeline, sink) = pipeline();
        pipeline
            .collect_once(&FixedSource(Ok(Some(json!({"status": {"busyStatus": "IDLE"}})))))
            .await;
        pipeline.report_once().await;

        let pushes = sink.pushes.lock();
        assert_eq!(pushes[0].1["stats"]["status"]["busyStatus"], "IDLE");
        assert_eq!(pushes[0].1["component"]["componentKey"], "k1");
        assert!(pushes[0].1["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn failed_push_resets_latest() {
        let (pipeline, sink) = pipeline();
        pipeline
            .collect_once(&FixedSource(Ok(Some(json!({"busy": false})))))
            .await;
        sink.fail.store(true, Ordering::SeqCst);
        pipeline.report_once().await;
        assert!(pipeline.latest().is_none());
    }

    /// Fails every push, but only once the test lets it through.
    #[derive(Default)]
    struct GatedSink {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl ReportSink for GatedSink {
        async fn push(&self, _event: &'static str, _payload: Value) -> Result<(), ChannelError> {
            self.entered.notify_one();
            self.release.notified().await;
            Err(ChannelError::NotConnected)
        }
    }

    #[tokio::test]
    async fn failed_push_keeps_newer_collection() {
        let sink = Arc::new(GatedSink::default());
        let pipeline = StatsPipeline::new(identity(), sink.clone());
        pipeline
            .collect_once(&FixedSource(Ok(Some(json!({"round": 1})))))
            .await;

        let reporter = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.report_once().await }
        });
        sink.entered.notified().await;
        pipeline
            .collect_once(&FixedSource(Ok(Some(json!({"round": 2})))))
            .await;
        sink.release.notify_one();
        tokio::time::timeout(Duration::from_secs(5), reporter)
            .await
            .expect("report finished")
            .expect("report task");

        let latest = pipeline.latest().expect("newer report kept");
        assert_eq!(latest.stats, Some(json!({"round": 2})));
    }

    #[tokio::test]
    async fn webhook_status_is_stored_and_pushed() {
        let (pipeline, sink) = pipeline();
        pipeline
            .publish_status(json!({"busyStatus": "BUSY"}))
            .await
            .expect("pushed");

        let latest = pipeline.latest().expect("latest");
        assert_eq!(latest.status, Some(json!({"busyStatus": "BUSY"})));
        assert!(latest.stats.is_none());
        assert_eq!(sink.pushes.lock()[0].1["status"]["busyStatus"], "BUSY");
    }

    #[tokio::test]
    async fn webhook_status_push_failure_is_reported() {
        let (pipeline, sink) = pipeline();
        sink.fail.store(true, Ordering::SeqCst);
        let err = pipeline
            .publish_status(json!({"busyStatus": "IDLE"}))
            .await
            .expect_err("not connected");
        assert!(matches!(err, ChannelError::NotConnected));
        // The report stays cached for the next reporter tick.
        assert!(pipeline.latest().is_some());
    }

    #[tokio::test]
    async fn session_report_is_pushed_not_cached() {
        let (pipeline, sink) = pipeline();
        pipeline
            .publish_session(SessionReport {
                session_id: "s1".into(),
                status: SessionStatus::On,
                sip_address: None,
                failure: None,
                should_retry: None,
                timestamp: None,
            })
            .await
            .expect("pushed");

        assert!(pipeline.latest().is_none());
        let pushes = sink.pushes.lock();
        assert_eq!(pushes[0].0, EVENT_SESSION_UPDATES);
        assert_eq!(pushes[0].1["status"], "ON");
        assert!(pushes[0].1["timestamp"].is_i64());
    }

    struct SlowSource {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl StatusSource for SlowSource {
        async fn fetch_status(&self) -> Result<Option<Value>, RequestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(json!({})))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn collector_never_overlaps_polls() {
        let (pipeline, _) = pipeline();
        let source = Arc::new(SlowSource {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let handle = pipeline.spawn_collector(source.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(20)).await;
        handle.abort();

        let calls = source.calls.load(Ordering::SeqCst);
        assert!((3..=4).contains(&calls), "calls = {calls}");
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_waits_one_interval_then_keeps_going() {
        let (pipeline, sink) = pipeline();
        sink.fail.store(true, Ordering::SeqCst);
        let handle = pipeline.spawn_reporter(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sink.pushes.lock().is_empty());

        // Failing pushes do not end the loop.
        tokio::time::sleep(Duration::from_secs(30)).await;
        sink.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        handle.abort();

        assert_eq!(sink.pushes.lock().len(), 1);
    }
}
