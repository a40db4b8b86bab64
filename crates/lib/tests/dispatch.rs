//! Integration tests: drive the channel manager with scripted adapters and pipelines.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use relay::channels::{
    ChannelAdapter, ChannelError, ChannelManager, ContentPart, DispatchSettings, EnqueueHandle,
    InboundItem, Meta, NativePayload, Request, Result, SessionKey,
};
use relay::pipeline::{Event, MessageStatus, Pipeline};
use relay::routing;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CHANNEL: &str = "rec";

/// What the pipeline saw: every request plus concurrency bookkeeping.
#[derive(Default)]
struct Trace {
    requests: Mutex<Vec<Request>>,
    active: Mutex<HashSet<String>>,
    overlap: AtomicBool,
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Trace {
    fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn texts(&self, n: usize) -> Vec<String> {
        texts(&self.requests.lock().unwrap()[n].parts)
    }
}

fn texts(parts: &[ContentPart]) -> Vec<String> {
    parts
        .iter()
        .filter_map(ContentPart::as_text)
        .map(str::to_string)
        .collect()
}

struct ScriptedPipeline {
    trace: Arc<Trace>,
    delay: Duration,
    error: Option<String>,
}

impl ScriptedPipeline {
    fn new(delay: Duration) -> (Arc<Self>, Arc<Trace>) {
        let trace = Arc::new(Trace::default());
        let pipeline = Arc::new(Self {
            trace: Arc::clone(&trace),
            delay,
            error: None,
        });
        (pipeline, trace)
    }
}

impl Pipeline for ScriptedPipeline {
    fn process(&self, request: Request) -> BoxStream<'static, Event> {
        let trace = Arc::clone(&self.trace);
        let delay = self.delay;
        let error = self.error.clone();
        stream::once(async move {
            let key = request.session_id.clone();
            if !trace.active.lock().unwrap().insert(key.clone()) {
                trace.overlap.store(true, Ordering::SeqCst);
            }
            let now = trace.current.fetch_add(1, Ordering::SeqCst) + 1;
            trace.max.fetch_max(now, Ordering::SeqCst);
            let reply = texts(&request.parts).join(" ");
            trace.requests.lock().unwrap().push(request);

            tokio::time::sleep(delay).await;

            trace.current.fetch_sub(1, Ordering::SeqCst);
            trace.active.lock().unwrap().remove(&key);
            match error {
                Some(e) => Event::Response { error: Some(e) },
                None => Event::Message {
                    status: MessageStatus::Completed,
                    parts: vec![ContentPart::text(format!("echo: {}", reply))],
                },
            }
        })
        .boxed()
    }
}

/// Panics inside `process` when a request carries the trigger text.
struct PanicOn {
    trigger: &'static str,
    inner: Arc<ScriptedPipeline>,
}

impl Pipeline for PanicOn {
    fn process(&self, request: Request) -> BoxStream<'static, Event> {
        if texts(&request.parts).iter().any(|t| t == self.trigger) {
            panic!("pipeline blew up on {}", self.trigger);
        }
        self.inner.process(request)
    }
}

/// Adapter that records sends and lifecycle calls into shared logs.
struct RecordingAdapter {
    id: String,
    label: String,
    sent: Arc<Mutex<Vec<(String, String)>>>,
    lifecycle: Arc<Mutex<Vec<String>>>,
    fail_start: bool,
    fatal_on_start: bool,
}

impl RecordingAdapter {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            label: id.to_string(),
            sent: Arc::default(),
            lifecycle: Arc::default(),
            fail_start: false,
            fatal_on_start: false,
        }
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, sink: EnqueueHandle) -> Result<()> {
        self.lifecycle.lock().unwrap().push(format!("start {}", self.label));
        if self.fatal_on_start {
            sink.report_fatal(&ChannelError::fatal_auth(&self.id, "token revoked"));
        }
        if self.fail_start {
            return Err(ChannelError::StartFailed {
                channel: self.id.clone(),
                reason: "refused".into(),
            });
        }
        Ok(())
    }

    async fn stop(&self) {
        self.lifecycle.lock().unwrap().push(format!("stop {}", self.label));
    }

    fn debounce_key(&self, item: &InboundItem) -> SessionKey {
        routing::conversation_key(item, routing::DEFAULT_SUFFIX_LEN)
    }

    async fn send(&self, handle: &str, text: &str, _meta: &Meta) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((format!("{}@{}", self.label, handle), text.to_string()));
        Ok(())
    }
}

fn item(conv: &str, text: &str) -> NativePayload {
    NativePayload::new(CHANNEL, "user-1")
        .with_conversation(conv)
        .with_text(text)
}

fn settings(workers: usize) -> DispatchSettings {
    DispatchSettings {
        workers_per_channel: workers,
        ..DispatchSettings::default()
    }
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn started(
    settings: DispatchSettings,
    pipeline: Arc<dyn Pipeline>,
    adapter: RecordingAdapter,
) -> ChannelManager {
    let manager = ChannelManager::new(settings, pipeline);
    manager.register(Arc::new(adapter));
    manager.start_all().await;
    manager
}

#[tokio::test]
async fn same_key_items_merge_into_one_batch() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::ZERO);
    let adapter = RecordingAdapter::new(CHANNEL);
    let sent = Arc::clone(&adapter.sent);
    let manager = started(settings(4), pipeline, adapter).await;

    for text in ["one", "two", "three"] {
        manager.try_enqueue(CHANNEL, item("room-a", text)).unwrap();
    }

    wait_for("delivery", || !sent.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(trace.count(), 1);
    assert_eq!(trace.texts(0), vec!["one", "two", "three"]);
    assert_eq!(
        *sent.lock().unwrap(),
        vec![("rec@rec:room-a".to_string(), "echo: one two three".to_string())]
    );
    manager.stop_all().await;
}

#[tokio::test]
async fn single_item_passes_through_unchanged() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::ZERO);
    let manager = started(settings(1), pipeline, RecordingAdapter::new(CHANNEL)).await;

    let mut payload = item("room-a", "hello");
    payload.meta.insert("lang".into(), json!("en"));
    manager.try_enqueue(CHANNEL, payload).unwrap();

    wait_for("request", || trace.count() == 1).await;
    let request = trace.requests.lock().unwrap()[0].clone();
    assert_eq!(texts(&request.parts), vec!["hello"]);
    assert_eq!(request.session_id, "rec:room-a");
    assert_eq!(request.user_id, "user-1");
    assert_eq!(request.meta.get("lang"), Some(&json!("en")));
    manager.stop_all().await;
}

#[tokio::test]
async fn arrivals_during_processing_form_the_next_batch() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::from_millis(150));
    let manager = started(settings(4), pipeline, RecordingAdapter::new(CHANNEL)).await;

    manager.try_enqueue(CHANNEL, item("room-a", "first")).unwrap();
    wait_for("first batch", || trace.count() == 1).await;

    manager.try_enqueue(CHANNEL, item("room-a", "second")).unwrap();
    manager.try_enqueue(CHANNEL, item("room-a", "third")).unwrap();
    let snapshot = manager.snapshot(CHANNEL).unwrap();
    assert_eq!(snapshot.in_progress, vec!["rec:room-a"]);
    assert_eq!(snapshot.pending.get("rec:room-a"), Some(&2));

    wait_for("second batch", || trace.count() == 2).await;
    assert_eq!(trace.texts(1), vec!["second", "third"]);
    assert!(!trace.overlap.load(Ordering::SeqCst));
    manager.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_keys_run_in_parallel() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::from_millis(200));
    let manager = started(settings(4), pipeline, RecordingAdapter::new(CHANNEL)).await;

    for conv in ["room-a", "room-b", "room-c"] {
        manager.try_enqueue(CHANNEL, item(conv, "hi")).unwrap();
    }

    wait_for("all batches", || trace.count() == 3).await;
    assert!(trace.max.load(Ordering::SeqCst) >= 2);
    assert!(!trace.overlap.load(Ordering::SeqCst));
    manager.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_is_never_processed_concurrently() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::from_millis(20));
    let manager = started(settings(4), pipeline, RecordingAdapter::new(CHANNEL)).await;

    for n in 0..20 {
        manager
            .try_enqueue(CHANNEL, item("room-a", &format!("m{}", n)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let total = || {
        let requests = trace.requests.lock().unwrap();
        requests.iter().map(|r| texts(&r.parts).len()).sum::<usize>()
    };
    wait_for("every message", || total() == 20).await;
    assert!(!trace.overlap.load(Ordering::SeqCst));

    let seen: Vec<String> = (0..trace.count()).flat_map(|n| trace.texts(n)).collect();
    let expected: Vec<String> = (0..20).map(|n| format!("m{}", n)).collect();
    assert_eq!(seen, expected);
    manager.stop_all().await;
}

#[tokio::test]
async fn text_and_image_arrive_as_one_request() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::ZERO);
    let adapter = RecordingAdapter::new(CHANNEL);
    let sent = Arc::clone(&adapter.sent);
    let manager = started(settings(2), pipeline, adapter).await;

    manager.try_enqueue(CHANNEL, item("room-a", "hi")).unwrap();
    let image = NativePayload::new(CHANNEL, "user-1")
        .with_conversation("room-a")
        .with_part(ContentPart::image("https://example.com/cat.png"));
    manager.try_enqueue(CHANNEL, image).unwrap();

    wait_for("delivery", || !sent.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(trace.count(), 1);
    let request = trace.requests.lock().unwrap()[0].clone();
    assert_eq!(request.parts.len(), 2);
    assert_eq!(request.parts[0].as_text(), Some("hi"));
    assert_eq!(request.parts[1].media_url(), Some("https://example.com/cat.png"));
    assert_eq!(sent.lock().unwrap().len(), 1);
    manager.stop_all().await;
}

#[tokio::test]
async fn two_workers_take_one_key_each() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::from_millis(150));
    let manager = started(settings(2), pipeline, RecordingAdapter::new(CHANNEL)).await;

    for n in 0..5 {
        manager.try_enqueue(CHANNEL, item("room-a", &format!("a{}", n))).unwrap();
        manager.try_enqueue(CHANNEL, item("room-b", &format!("b{}", n))).unwrap();
    }

    wait_for("both batches", || trace.count() == 2).await;
    assert_eq!(trace.max.load(Ordering::SeqCst), 2);
    let mut batches = vec![trace.texts(0), trace.texts(1)];
    batches.sort();
    assert_eq!(batches[0], vec!["a0", "a1", "a2", "a3", "a4"]);
    assert_eq!(batches[1], vec!["b0", "b1", "b2", "b3", "b4"]);
    manager.stop_all().await;
}

#[tokio::test]
async fn full_queue_rejects_new_items() {
    let (pipeline, _trace) = ScriptedPipeline::new(Duration::ZERO);
    let settings = DispatchSettings {
        queue_capacity: 1,
        ..settings(1)
    };
    let manager = started(settings, pipeline, RecordingAdapter::new(CHANNEL)).await;

    manager.try_enqueue(CHANNEL, item("room-a", "x")).unwrap();
    let err = manager.try_enqueue(CHANNEL, item("room-b", "y")).unwrap_err();
    assert!(matches!(err, ChannelError::Capacity { ref key, .. } if key == "rec:room-b"));
    assert_eq!(manager.snapshot(CHANNEL).unwrap().queued, 1);
    manager.stop_all().await;
}

#[tokio::test]
async fn unknown_channel_is_rejected() {
    let (pipeline, _trace) = ScriptedPipeline::new(Duration::ZERO);
    let manager = started(settings(1), pipeline, RecordingAdapter::new(CHANNEL)).await;
    let err = manager.try_enqueue("nope", item("room-a", "x")).unwrap_err();
    assert!(matches!(err, ChannelError::UnknownChannel(ref id) if id == "nope"));
    manager.stop_all().await;
}

#[tokio::test]
async fn textless_item_waits_for_text() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::ZERO);
    let manager = started(settings(2), pipeline, RecordingAdapter::new(CHANNEL)).await;

    let image = NativePayload::new(CHANNEL, "user-1")
        .with_conversation("room-a")
        .with_part(ContentPart::image("https://example.com/cat.png"));
    manager.try_enqueue(CHANNEL, image).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(trace.count(), 0);
    assert_eq!(manager.snapshot(CHANNEL).unwrap().held, 1);

    manager.try_enqueue(CHANNEL, item("room-a", "what is this?")).unwrap();
    wait_for("merged request", || trace.count() == 1).await;
    let request = trace.requests.lock().unwrap()[0].clone();
    assert_eq!(request.parts.len(), 2);
    assert_eq!(request.parts[0].media_url(), Some("https://example.com/cat.png"));
    assert_eq!(request.parts[1].as_text(), Some("what is this?"));
    manager.stop_all().await;
}

#[tokio::test]
async fn enqueue_handle_feeds_the_queue() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::ZERO);
    let manager = started(settings(1), pipeline, RecordingAdapter::new(CHANNEL)).await;

    let handle = manager.handle(CHANNEL);
    handle.enqueue(item("room-a", "via handle"));
    manager.enqueue(CHANNEL, item("room-b", "via manager"));

    wait_for("both requests", || trace.count() == 2).await;
    manager.stop_all().await;
}

#[tokio::test]
async fn pipeline_error_sends_fallback() {
    let trace = Arc::new(Trace::default());
    let pipeline = Arc::new(ScriptedPipeline {
        trace: Arc::clone(&trace),
        delay: Duration::ZERO,
        error: Some("model unavailable".into()),
    });
    let adapter = RecordingAdapter::new(CHANNEL);
    let sent = Arc::clone(&adapter.sent);
    let manager = started(settings(1), pipeline, adapter).await;

    manager.try_enqueue(CHANNEL, item("room-a", "hi")).unwrap();
    wait_for("fallback", || !sent.lock().unwrap().is_empty()).await;
    let (handle, text) = sent.lock().unwrap()[0].clone();
    assert_eq!(handle, "rec@rec:room-a");
    assert!(!text.contains("model unavailable"));
    manager.stop_all().await;
}

#[tokio::test]
async fn stop_all_stops_adapters_in_reverse_order() {
    let (pipeline, _trace) = ScriptedPipeline::new(Duration::ZERO);
    let manager = ChannelManager::new(settings(1), pipeline);
    let lifecycle: Arc<Mutex<Vec<String>>> = Arc::default();
    for id in ["one", "two", "three"] {
        let mut adapter = RecordingAdapter::new(id);
        adapter.lifecycle = Arc::clone(&lifecycle);
        manager.register(Arc::new(adapter));
    }
    manager.start_all().await;
    assert!(manager.is_running().await);
    manager.stop_all().await;
    assert!(!manager.is_running().await);

    assert_eq!(
        *lifecycle.lock().unwrap(),
        vec!["start one", "start two", "start three", "stop three", "stop two", "stop one"]
    );
    assert!(manager.snapshots().is_empty());
}

#[tokio::test]
async fn failed_replacement_keeps_the_old_adapter() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::ZERO);
    let mut old = RecordingAdapter::new(CHANNEL);
    old.label = "old".into();
    let sent = Arc::clone(&old.sent);
    let manager = started(settings(1), pipeline, old).await;

    let mut broken = RecordingAdapter::new(CHANNEL);
    broken.label = "new".into();
    broken.fail_start = true;
    let broken_log = Arc::clone(&broken.lifecycle);
    let err = manager.replace_channel(Arc::new(broken)).await.unwrap_err();
    assert!(matches!(err, ChannelError::StartFailed { .. }));
    assert_eq!(*broken_log.lock().unwrap(), vec!["start new", "stop new"]);

    manager.try_enqueue(CHANNEL, item("room-a", "still here?")).unwrap();
    wait_for("delivery", || !sent.lock().unwrap().is_empty()).await;
    assert_eq!(trace.count(), 1);
    assert_eq!(sent.lock().unwrap()[0].0, "old@rec:room-a");
    manager.stop_all().await;
}

#[tokio::test]
async fn successful_replacement_swaps_delivery() {
    let (pipeline, _trace) = ScriptedPipeline::new(Duration::ZERO);
    let mut old = RecordingAdapter::new(CHANNEL);
    old.label = "old".into();
    let old_log = Arc::clone(&old.lifecycle);
    let manager = started(settings(1), pipeline, old).await;

    let mut new = RecordingAdapter::new(CHANNEL);
    new.label = "new".into();
    let sent = Arc::clone(&new.sent);
    manager.replace_channel(Arc::new(new)).await.unwrap();
    assert_eq!(*old_log.lock().unwrap(), vec!["start old", "stop old"]);

    manager.try_enqueue(CHANNEL, item("room-a", "hello")).unwrap();
    wait_for("delivery", || !sent.lock().unwrap().is_empty()).await;
    assert_eq!(sent.lock().unwrap()[0].0, "new@rec:room-a");
    manager.stop_all().await;
}

#[tokio::test]
async fn panicking_pipeline_sends_fallback_and_worker_continues() {
    let (inner, trace) = ScriptedPipeline::new(Duration::ZERO);
    let pipeline = Arc::new(PanicOn {
        trigger: "boom",
        inner,
    });
    let adapter = RecordingAdapter::new(CHANNEL);
    let sent = Arc::clone(&adapter.sent);
    let manager = started(settings(1), pipeline, adapter).await;

    manager.try_enqueue(CHANNEL, item("room-a", "boom")).unwrap();
    wait_for("fallback", || !sent.lock().unwrap().is_empty()).await;
    let (handle, text) = sent.lock().unwrap()[0].clone();
    assert_eq!(handle, "rec@rec:room-a");
    assert!(text.starts_with("Sorry"));
    assert!(!text.contains("blew up"));
    assert!(manager.snapshot(CHANNEL).unwrap().in_progress.is_empty());

    manager.try_enqueue(CHANNEL, item("room-b", "fine")).unwrap();
    wait_for("next item", || sent.lock().unwrap().len() == 2).await;
    assert_eq!(trace.texts(0), vec!["fine"]);
    assert_eq!(
        sent.lock().unwrap()[1],
        ("rec@rec:room-b".to_string(), "echo: fine".to_string())
    );
    manager.stop_all().await;
}

#[tokio::test]
async fn items_posted_around_stop_are_not_replayed() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::ZERO);
    let manager = started(settings(1), pipeline, RecordingAdapter::new(CHANNEL)).await;

    // Still in the bridge when the dispatcher is cancelled.
    manager.enqueue(CHANNEL, item("room-a", "racing shutdown"));
    manager.stop_all().await;
    manager.enqueue(CHANNEL, item("room-b", "after stop"));

    manager.start_all().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(trace.count(), 0);

    manager.enqueue(CHANNEL, item("room-c", "fresh"));
    wait_for("fresh item", || trace.count() == 1).await;
    assert_eq!(trace.texts(0), vec!["fresh"]);
    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn stop_all_waits_for_in_flight_batch_within_grace() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::from_secs(2));
    let adapter = RecordingAdapter::new(CHANNEL);
    let sent = Arc::clone(&adapter.sent);
    let settings = DispatchSettings {
        shutdown_grace: Duration::from_secs(5),
        ..settings(1)
    };
    let manager = started(settings, pipeline, adapter).await;

    manager.try_enqueue(CHANNEL, item("room-a", "slow")).unwrap();
    wait_for("processing", || trace.count() == 1).await;
    let began = tokio::time::Instant::now();
    manager.stop_all().await;

    assert!(began.elapsed() < Duration::from_secs(5));
    assert_eq!(
        *sent.lock().unwrap(),
        vec![("rec@rec:room-a".to_string(), "echo: slow".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_all_aborts_batch_running_past_grace() {
    let (pipeline, trace) = ScriptedPipeline::new(Duration::from_secs(60));
    let adapter = RecordingAdapter::new(CHANNEL);
    let sent = Arc::clone(&adapter.sent);
    let settings = DispatchSettings {
        shutdown_grace: Duration::from_secs(1),
        ..settings(1)
    };
    let manager = started(settings, pipeline, adapter).await;

    manager.try_enqueue(CHANNEL, item("room-a", "endless")).unwrap();
    wait_for("processing", || trace.count() == 1).await;
    let began = tokio::time::Instant::now();
    manager.stop_all().await;

    let waited = began.elapsed();
    assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(60));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(sent.lock().unwrap().is_empty());
    assert!(manager.snapshots().is_empty());
}

#[tokio::test]
async fn fatal_report_shows_in_snapshot_until_restart() {
    let (pipeline, _trace) = ScriptedPipeline::new(Duration::ZERO);
    let mut dying = RecordingAdapter::new(CHANNEL);
    dying.fatal_on_start = true;
    let manager = started(settings(1), pipeline, dying).await;

    let snapshot = manager.snapshot(CHANNEL).unwrap();
    let fault = snapshot.fault.clone().expect("fault recorded");
    assert!(fault.contains("token revoked"));
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["fault"], json!(fault));

    manager
        .replace_channel(Arc::new(RecordingAdapter::new(CHANNEL)))
        .await
        .unwrap();
    let snapshot = manager.snapshot(CHANNEL).unwrap();
    assert_eq!(snapshot.fault, None);
    assert!(serde_json::to_value(&snapshot).unwrap().get("fault").is_none());
    manager.stop_all().await;
}
