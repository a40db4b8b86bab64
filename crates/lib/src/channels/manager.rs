//! Channel manager: per-channel queues, worker pools and single-flight session processing.
//!
//! Every inbound item crosses into the engine through an [`EnqueueHandle`]. The manager's
//! dispatcher task applies each item to its channel's queue state: items whose session key is
//! being processed are parked in the pending map, everything else joins the bounded queue.
//! Workers claim one queued entry plus every other queued entry with the same key, merge the
//! burst, process it, then re-queue whatever arrived for that key in the meantime.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channels::adapter::ChannelAdapter;
use crate::channels::debounce::{self, TextlessBuffer};
use crate::channels::inbound::{InboundItem, Meta, SessionKey};
use crate::channels::process::{self, Failure};
use crate::channels::{ChannelError, Result};
use crate::pipeline::Pipeline;

/// Tunables for queues, workers and processing.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub queue_capacity: usize,
    pub workers_per_channel: usize,
    pub shutdown_grace: Duration,
    pub process_timeout: Duration,
    pub text_buffer_ttl: Duration,
    /// Prefix applied to outgoing text unless the request carries its own `text_prefix`.
    pub text_prefix: Option<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            workers_per_channel: 4,
            shutdown_grace: Duration::from_secs(5),
            process_timeout: Duration::from_secs(300),
            text_buffer_ttl: Duration::from_secs(600),
            text_prefix: None,
        }
    }
}

/// An item posted through an [`EnqueueHandle`].
#[derive(Debug)]
pub struct Enqueued {
    pub channel: String,
    pub item: InboundItem,
}

/// State every handle of one manager shares with it.
struct Bridge {
    /// Cleared while the manager is stopped; items posted then are dropped with a log line.
    open: AtomicBool,
    /// Last fatal error per channel, kept until the channel is started again.
    faults: Mutex<HashMap<String, String>>,
}

impl Bridge {
    fn new(open: bool) -> Self {
        Self {
            open: AtomicBool::new(open),
            faults: Mutex::new(HashMap::new()),
        }
    }

    fn fault(&self, channel: &str) -> Option<String> {
        lock(&self.faults).get(channel).cloned()
    }
}

/// Cloneable, thread-safe entry point into the engine. `enqueue` never blocks and may be
/// called from any thread, inside or outside the tokio runtime.
#[derive(Clone)]
pub struct EnqueueHandle {
    channel: String,
    tx: mpsc::UnboundedSender<Enqueued>,
    bridge: Arc<Bridge>,
}

impl EnqueueHandle {
    /// A handle not attached to a manager; the caller owns the receiving side.
    pub fn detached(channel: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Enqueued>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                channel: channel.into(),
                tx,
                bridge: Arc::new(Bridge::new(true)),
            },
            rx,
        )
    }

    /// Channel this handle enqueues into.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn enqueue(&self, item: impl Into<InboundItem>) {
        self.enqueue_to(&self.channel, item);
    }

    /// Enqueue into another channel through the same bridge.
    pub fn enqueue_to(&self, channel: &str, item: impl Into<InboundItem>) {
        let posted = Enqueued {
            channel: channel.to_string(),
            item: item.into(),
        };
        if !self.bridge.open.load(Ordering::SeqCst) {
            log::error!(
                "manager: not running, dropping item for {}: {}",
                posted.channel,
                posted.item.summary()
            );
            return;
        }
        if let Err(mpsc::error::SendError(lost)) = self.tx.send(posted) {
            log::error!(
                "manager: engine is gone, dropping item for {}: {}",
                lost.channel,
                lost.item.summary()
            );
        }
    }

    /// Report that this channel stopped itself for good (credentials rejected, reconnect
    /// attempts exhausted). The error shows in the channel's snapshot until it starts again.
    pub fn report_fatal(&self, error: &ChannelError) {
        log::error!("manager: channel {} stopped: {}", self.channel, error);
        lock(&self.bridge.faults).insert(self.channel.clone(), error.to_string());
    }

    /// Fatal error last reported for this handle's channel.
    pub fn fault(&self) -> Option<String> {
        self.bridge.fault(&self.channel)
    }
}

/// Point-in-time view of one channel's queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub id: String,
    pub queued: usize,
    pub in_progress: Vec<SessionKey>,
    /// Pending item count per in-progress key.
    pub pending: BTreeMap<SessionKey, usize>,
    /// Sessions holding text-less content.
    pub held: usize,
    /// Why the channel stopped itself, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

struct Queued {
    key: SessionKey,
    item: InboundItem,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Queued>,
    in_progress: HashSet<SessionKey>,
    pending: HashMap<SessionKey, Vec<InboundItem>>,
}

/// Queue state and wakeup for one channel.
struct ChannelQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    buffer: TextlessBuffer,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match l.read() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match l.write() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ChannelQueue {
    fn new(capacity: usize, text_buffer_ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            buffer: TextlessBuffer::new(text_buffer_ttl),
        }
    }

    /// Park behind an in-progress key, or append to the queue if there is room.
    fn offer(&self, channel: &str, key: SessionKey, item: InboundItem) -> Result<()> {
        let mut st = lock(&self.state);
        if st.in_progress.contains(&key) {
            log::debug!("manager: {} busy on {}, parking item as pending", key, channel);
            st.pending.entry(key).or_default().push(item);
            return Ok(());
        }
        if st.queue.len() >= self.capacity {
            return Err(ChannelError::Capacity {
                channel: channel.to_string(),
                key,
            });
        }
        st.queue.push_back(Queued { key, item });
        drop(st);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the head entry, mark its key in progress and drain every other queued entry with
    /// the same key. Entries with other keys keep their relative order.
    fn claim(&self) -> Option<(SessionKey, Vec<InboundItem>)> {
        let mut st = lock(&self.state);
        let head = st.queue.pop_front()?;
        let key = head.key;
        let mut batch = vec![head.item];
        let mut rest = VecDeque::with_capacity(st.queue.len());
        for entry in st.queue.drain(..) {
            if entry.key == key {
                batch.push(entry.item);
            } else {
                rest.push_back(entry);
            }
        }
        st.queue = rest;
        st.in_progress.insert(key.clone());
        let more = !st.queue.is_empty();
        drop(st);
        if more {
            self.notify.notify_one();
        }
        Some((key, batch))
    }

    async fn next_batch(&self) -> (SessionKey, Vec<InboundItem>) {
        loop {
            if let Some(claimed) = self.claim() {
                return claimed;
            }
            self.notify.notified().await;
        }
    }

    /// Release `key` and re-queue, merged, whatever was parked for it while it ran.
    /// Re-queued work was already accepted once, so capacity is not checked again.
    fn complete(&self, channel: &str, key: &str, adapter: Option<&dyn ChannelAdapter>) {
        let mut st = lock(&self.state);
        st.in_progress.remove(key);
        let parked = match st.pending.remove(key) {
            Some(items) if !items.is_empty() => items,
            _ => return,
        };
        let count = parked.len();
        let Some(adapter) = adapter else {
            log::error!(
                "manager: no adapter for {}, dropping {} pending item(s) for {}",
                channel,
                count,
                key
            );
            return;
        };
        match debounce::merge_batch(adapter, parked) {
            Ok(Some(item)) => {
                log::debug!(
                    "manager: re-queueing {} pending item(s) for {} on {}",
                    count,
                    key,
                    channel
                );
                st.queue.push_back(Queued {
                    key: key.to_string(),
                    item,
                });
                drop(st);
                self.notify.notify_one();
            }
            Ok(None) => {}
            Err(e) => log::error!(
                "manager: dropping {} pending item(s) for {} on {}: merge failed: {}",
                count,
                key,
                channel,
                e
            ),
        }
    }

    fn snapshot(&self, id: &str) -> ChannelSnapshot {
        let st = lock(&self.state);
        let mut in_progress: Vec<SessionKey> = st.in_progress.iter().cloned().collect();
        in_progress.sort();
        ChannelSnapshot {
            id: id.to_string(),
            queued: st.queue.len(),
            in_progress,
            pending: st
                .pending
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
            held: self.buffer.held_sessions(),
            fault: None,
        }
    }

    /// Drop all queued, pending and held content, logging what was discarded.
    fn discard(&self, id: &str) {
        let mut st = lock(&self.state);
        for entry in st.queue.drain(..) {
            log::warn!(
                "manager: discarding queued item for {} on {}: {}",
                entry.key,
                id,
                entry.item.summary()
            );
        }
        for (key, items) in st.pending.drain() {
            log::warn!(
                "manager: discarding {} pending item(s) for {} on {}",
                items.len(),
                key,
                id
            );
        }
        st.in_progress.clear();
        drop(st);
        self.buffer.clear();
    }
}

/// State shared by the manager, its dispatcher and its workers.
struct Shared {
    settings: DispatchSettings,
    pipeline: Arc<dyn Pipeline>,
    /// Registration order is kept for reverse-order stop.
    adapters: RwLock<Vec<(String, Arc<dyn ChannelAdapter>)>>,
    queues: RwLock<HashMap<String, Arc<ChannelQueue>>>,
}

impl Shared {
    fn adapter(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        read(&self.adapters)
            .iter()
            .find(|(id, _)| id == channel)
            .map(|(_, a)| Arc::clone(a))
    }

    fn queue(&self, channel: &str) -> Option<Arc<ChannelQueue>> {
        read(&self.queues).get(channel).cloned()
    }

    fn try_enqueue(&self, channel: &str, item: InboundItem) -> Result<()> {
        let adapter = self
            .adapter(channel)
            .ok_or_else(|| ChannelError::UnknownChannel(channel.to_string()))?;
        let queue = self
            .queue(channel)
            .ok_or_else(|| ChannelError::UnknownChannel(channel.to_string()))?;
        let key = adapter.debounce_key(&item);
        if !adapter.uses_queue() {
            log::debug!("manager: processing {} on {} without queue", key, channel);
            let settings = self.settings.clone();
            let pipeline = Arc::clone(&self.pipeline);
            let (handle, meta) = process::reply_target(adapter.as_ref(), &settings, &key, &item);
            tokio::spawn(async move {
                let run = process::consume(
                    adapter.as_ref(),
                    pipeline.as_ref(),
                    &queue.buffer,
                    &settings,
                    item,
                );
                if AssertUnwindSafe(run).catch_unwind().await.is_err() {
                    log::error!("manager: processing panicked for {}", key);
                    process::send_fallback(adapter.as_ref(), &handle, &meta, &Failure::Panicked).await;
                }
            });
            return Ok(());
        }
        queue.offer(channel, key, item)
    }

    fn apply(&self, posted: Enqueued) {
        let summary = posted.item.summary();
        if let Err(e) = self.try_enqueue(&posted.channel, posted.item) {
            log::error!("manager: dropped item on {}: {} ({})", posted.channel, e, summary);
        }
    }
}

struct Running {
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Owns the channel registry, queues and worker pools.
pub struct ChannelManager {
    shared: Arc<Shared>,
    bridge: Arc<Bridge>,
    tx: mpsc::UnboundedSender<Enqueued>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Enqueued>>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl ChannelManager {
    pub fn new(settings: DispatchSettings, pipeline: Arc<dyn Pipeline>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                settings,
                pipeline,
                adapters: RwLock::new(Vec::new()),
                queues: RwLock::new(HashMap::new()),
            }),
            bridge: Arc::new(Bridge::new(false)),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.shared.settings
    }

    /// Add an adapter before `start_all`. A second adapter with the same id replaces the first
    /// in place (use `replace_channel` once running).
    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        let id = adapter.id().to_string();
        let mut adapters = write(&self.shared.adapters);
        match adapters.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => {
                log::warn!("manager: channel {} registered twice, keeping the latest", id);
                slot.1 = adapter;
            }
            None => adapters.push((id, adapter)),
        }
    }

    /// Registered channel ids in registration order.
    pub fn channel_ids(&self) -> Vec<String> {
        read(&self.shared.adapters)
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Enqueue handle bound to `channel`.
    pub fn handle(&self, channel: &str) -> EnqueueHandle {
        EnqueueHandle {
            channel: channel.to_string(),
            tx: self.tx.clone(),
            bridge: Arc::clone(&self.bridge),
        }
    }

    /// Post an item; applied by the dispatcher in arrival order. Never blocks or fails:
    /// unknown channels, full queues and a stopped manager are logged and the item dropped.
    pub fn enqueue(&self, channel: &str, item: impl Into<InboundItem>) {
        self.handle(channel).enqueue(item);
    }

    /// Apply an item to the channel's queue state right now.
    pub fn try_enqueue(&self, channel: &str, item: impl Into<InboundItem>) -> Result<()> {
        self.shared.try_enqueue(channel, item.into())
    }

    pub fn snapshot(&self, channel: &str) -> Option<ChannelSnapshot> {
        self.shared.queue(channel).map(|q| ChannelSnapshot {
            fault: self.bridge.fault(channel),
            ..q.snapshot(channel)
        })
    }

    /// Snapshots of every registered channel with a queue, in registration order.
    pub fn snapshots(&self) -> Vec<ChannelSnapshot> {
        self.channel_ids()
            .iter()
            .filter_map(|id| self.snapshot(id))
            .collect()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Create the queue for `channel` (and its workers, for queue-based adapters) if missing.
    fn ensure_queue(
        &self,
        channel: &str,
        adapter: &dyn ChannelAdapter,
        run: &mut Running,
    ) {
        let settings = &self.shared.settings;
        let queue = {
            let mut queues = write(&self.shared.queues);
            if queues.contains_key(channel) {
                return;
            }
            let queue = Arc::new(ChannelQueue::new(
                settings.queue_capacity,
                settings.text_buffer_ttl,
            ));
            queues.insert(channel.to_string(), Arc::clone(&queue));
            queue
        };
        if !adapter.uses_queue() {
            return;
        }
        let workers = settings.workers_per_channel.max(1);
        log::info!(
            "manager: {} queue ready (capacity {}, {} workers)",
            channel,
            queue.capacity,
            workers
        );
        for n in 0..workers {
            run.workers.push(tokio::spawn(worker_loop(
                Arc::clone(&self.shared),
                channel.to_string(),
                Arc::clone(&queue),
                run.cancel.clone(),
                n,
            )));
        }
    }

    /// Allocate queues, spawn workers and the dispatcher, then start every adapter.
    /// A failing adapter is logged; the others still start.
    pub async fn start_all(&self) {
        let adapters: Vec<(String, Arc<dyn ChannelAdapter>)> = read(&self.shared.adapters).clone();
        {
            let mut running = self.running.lock().await;
            if running.is_some() {
                log::warn!("manager: start_all called while running");
                return;
            }
            drop_posted(&mut *self.rx.lock().await, "posted while stopped");
            let cancel = CancellationToken::new();
            let dispatcher = tokio::spawn(dispatch_loop(
                Arc::clone(&self.shared),
                Arc::clone(&self.rx),
                cancel.clone(),
            ));
            let mut run = Running {
                cancel,
                dispatcher,
                workers: Vec::new(),
            };
            for (id, adapter) in &adapters {
                self.ensure_queue(id, adapter.as_ref(), &mut run);
            }
            *running = Some(run);
            self.bridge.open.store(true, Ordering::SeqCst);
        }
        for (id, adapter) in &adapters {
            lock(&self.bridge.faults).remove(id);
            match adapter.start(self.handle(id)).await {
                Ok(()) => log::info!("manager: channel {} started", id),
                Err(e) => log::error!("manager: channel {} failed to start: {}", id, e),
            }
        }
    }

    /// Refuse new items, cancel workers (finishing in-flight batches up to the grace period),
    /// discard queue state, then stop adapters in reverse registration order.
    pub async fn stop_all(&self) {
        let run = self.running.lock().await.take();
        if let Some(run) = run {
            self.bridge.open.store(false, Ordering::SeqCst);
            run.cancel.cancel();
            let deadline = tokio::time::Instant::now() + self.shared.settings.shutdown_grace;
            let mut aborted = 0usize;
            for mut worker in run.workers {
                if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                    worker.abort();
                    aborted += 1;
                }
            }
            if aborted > 0 {
                log::warn!("manager: aborted {} worker(s) after shutdown grace period", aborted);
            }
            if let Err(e) = run.dispatcher.await {
                log::warn!("manager: dispatcher ended abnormally: {}", e);
            }
            let queues: Vec<(String, Arc<ChannelQueue>)> =
                write(&self.shared.queues).drain().collect();
            for (id, queue) in queues {
                queue.discard(&id);
            }
        }
        let adapters: Vec<(String, Arc<dyn ChannelAdapter>)> = read(&self.shared.adapters).clone();
        for (id, adapter) in adapters.iter().rev() {
            adapter.stop().await;
            log::info!("manager: channel {} stopped", id);
        }
    }

    /// Hot-swap the adapter for `adapter.id()`. The new adapter is started outside any lock;
    /// if that fails it is stopped and the old adapter stays in place.
    pub async fn replace_channel(&self, adapter: Arc<dyn ChannelAdapter>) -> Result<()> {
        let id = adapter.id().to_string();
        {
            let mut running = self.running.lock().await;
            match running.as_mut() {
                Some(run) => self.ensure_queue(&id, adapter.as_ref(), run),
                None => {
                    drop(running);
                    log::info!("manager: not running, registering {} for the next start", id);
                    self.register(adapter);
                    return Ok(());
                }
            }
        }

        let previous_fault = lock(&self.bridge.faults).remove(&id);
        if let Err(e) = adapter.start(self.handle(&id)).await {
            adapter.stop().await;
            if let Some(fault) = previous_fault {
                lock(&self.bridge.faults).insert(id.clone(), fault);
            }
            log::error!("manager: replacement for {} failed to start: {}", id, e);
            return Err(ChannelError::StartFailed {
                channel: id,
                reason: e.to_string(),
            });
        }

        let old = {
            let mut adapters = write(&self.shared.adapters);
            match adapters.iter_mut().find(|(existing, _)| *existing == id) {
                Some(slot) => Some(std::mem::replace(&mut slot.1, adapter)),
                None => {
                    adapters.push((id.clone(), adapter));
                    None
                }
            }
        };
        if let Some(old) = old {
            old.stop().await;
        }
        log::info!("manager: channel {} replaced", id);
        Ok(())
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.bridge.open.store(false, Ordering::SeqCst);
        if let Some(run) = self.running.get_mut().take() {
            run.cancel.cancel();
        }
        // A running dispatcher holds the receiver and drains it once cancelled.
        if let Ok(mut rx) = self.rx.try_lock() {
            drop_posted(&mut rx, "manager dropped");
        }
    }
}

/// Log and drop everything still sitting in the bridge.
fn drop_posted(rx: &mut mpsc::UnboundedReceiver<Enqueued>, why: &str) {
    while let Ok(posted) = rx.try_recv() {
        log::error!(
            "manager: {}, dropping item for {}: {}",
            why,
            posted.channel,
            posted.item.summary()
        );
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Enqueued>>>,
    cancel: CancellationToken,
) {
    let mut rx = rx.lock().await;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            posted = rx.recv() => match posted {
                Some(posted) => shared.apply(posted),
                None => break,
            },
        }
    }
    drop_posted(&mut rx, "stopping");
    log::debug!("manager: dispatcher stopped");
}

async fn worker_loop(
    shared: Arc<Shared>,
    channel: String,
    queue: Arc<ChannelQueue>,
    cancel: CancellationToken,
    n: usize,
) {
    log::debug!("manager: worker {}#{} started", channel, n);
    loop {
        let (key, batch) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            claimed = queue.next_batch() => claimed,
        };
        let adapter = shared.adapter(&channel);
        let Some(adapter) = adapter else {
            log::error!(
                "manager: no adapter for {}, dropping {} item(s) for {}",
                channel,
                batch.len(),
                key
            );
            queue.complete(&channel, &key, None);
            continue;
        };
        let size = batch.len();
        log::debug!("manager: worker {}#{} claimed {} item(s) for {}", channel, n, size, key);

        let mut target: Option<(String, Meta)> = None;
        let run = async {
            match debounce::merge_batch(adapter.as_ref(), batch) {
                Ok(Some(item)) => {
                    target = Some(process::reply_target(
                        adapter.as_ref(),
                        &shared.settings,
                        &key,
                        &item,
                    ));
                    process::consume(
                        adapter.as_ref(),
                        shared.pipeline.as_ref(),
                        &queue.buffer,
                        &shared.settings,
                        item,
                    )
                    .await;
                }
                Ok(None) => {}
                Err(e) => log::error!(
                    "manager: dropping {} item(s) for {} on {}: merge failed: {}",
                    size,
                    key,
                    channel,
                    e
                ),
            }
        };
        if AssertUnwindSafe(run).catch_unwind().await.is_err() {
            log::error!("manager: processing panicked on {} (key {})", channel, key);
            let (handle, meta) = target.unwrap_or_else(|| (key.clone(), Meta::new()));
            process::send_fallback(adapter.as_ref(), &handle, &meta, &Failure::Panicked).await;
        }
        queue.complete(&channel, &key, Some(adapter.as_ref()));
    }
    log::debug!("manager: worker {}#{} stopped", channel, n);
}
