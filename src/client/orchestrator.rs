use crate::client::error::TransferError;
use crate::client::progress::{self, ActivationMeter};
use crate::client::source::UploadSource;
use crate::client::transport::UploadTransport;
use crate::models::{
    CompleteUploadRequest, CompleteUploadResponse, Destination, ErrorCode, InitUploadRequest,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
}

/// Client-side view of one enqueued file.
#[derive(Debug, Clone, Serialize)]
pub struct UploadItem {
    pub id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    pub destination: Destination,
    /// Assigned by a successful init and reused across pause/resume.
    pub session_id: Option<String>,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub next_chunk_index: u32,
    pub state: UploadState,
    pub bytes_sent: u64,
    /// When the item last became active.
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub asset: Option<CompleteUploadResponse>,
    /// Indices the receiver reported missing, sent again before the next completion.
    pub resend: Vec<u32>,
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    Enqueued {
        id: Uuid,
    },
    StateChanged {
        id: Uuid,
        from: UploadState,
        to: UploadState,
    },
    Progress {
        id: Uuid,
        bytes_sent: u64,
        total_bytes: u64,
        next_chunk_index: u32,
        total_chunks: u32,
        bytes_per_second: f64,
        eta: Option<Duration>,
    },
    Removed {
        id: Uuid,
    },
}

struct Entry {
    item: UploadItem,
    source: Arc<dyn UploadSource>,
    meter: Option<ActivationMeter>,
}

/// The transfer holding the active slot.
struct Run {
    id: Uuid,
    token: CancellationToken,
    /// False while an init or complete call is in flight. Pausing then waits for
    /// the call to land, since the receiver may already have acted on it.
    interruptible: bool,
    pause_requested: bool,
}

#[derive(Default)]
struct Queue {
    entries: Vec<Entry>,
    paused: bool,
    active: Option<Run>,
    paused_stack: Vec<Uuid>,
}

impl Queue {
    fn entry_mut(&mut self, id: Uuid) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.item.id == id)
    }

    /// True while `token` still owns the active slot for `id`.
    fn is_current(&self, id: Uuid, token: &CancellationToken) -> bool {
        !token.is_cancelled() && matches!(&self.active, Some(run) if run.id == id)
    }
}

/// Snapshot of what a run needs, taken once at activation.
struct Plan {
    source: Arc<dyn UploadSource>,
    file_name: String,
    file_size: u64,
    destination: Destination,
    session_id: Option<String>,
    chunk_size: u64,
    total_chunks: u32,
    next_chunk_index: u32,
    resend: Vec<u32>,
}

struct Inner {
    transport: Arc<dyn UploadTransport>,
    chunk_size: u64,
    request_timeout: Option<Duration>,
    queue: Mutex<Queue>,
    events: broadcast::Sender<UploadEvent>,
}

/// Owns the upload queue and drives at most one transfer at a time.
///
/// State only changes through the methods below. A running transfer holds a
/// cancellation token for the active slot; `pause`, `cancel` and `clear_queue`
/// revoke the token and the transfer's late results are discarded. A pause that
/// arrives during an init or complete call takes effect once that call returns.
/// Methods that may start a transfer spawn onto the current Tokio runtime.
#[derive(Clone)]
pub struct UploadOrchestrator {
    inner: Arc<Inner>,
}

impl UploadOrchestrator {
    pub fn new(transport: Arc<dyn UploadTransport>, chunk_size: usize) -> Self {
        Self::build(transport, chunk_size, None)
    }

    /// Bounds every init, chunk and complete call.
    pub fn with_request_timeout(
        transport: Arc<dyn UploadTransport>,
        chunk_size: usize,
        timeout: Duration,
    ) -> Self {
        Self::build(transport, chunk_size, Some(timeout))
    }

    fn build(
        transport: Arc<dyn UploadTransport>,
        chunk_size: usize,
        request_timeout: Option<Duration>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                chunk_size: chunk_size.max(1) as u64,
                request_timeout,
                queue: Mutex::new(Queue::default()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> Vec<UploadItem> {
        self.queue().entries.iter().map(|e| e.item.clone()).collect()
    }

    pub fn item(&self, id: Uuid) -> Option<UploadItem> {
        self.queue()
            .entries
            .iter()
            .find(|e| e.item.id == id)
            .map(|e| e.item.clone())
    }

    pub fn is_paused(&self) -> bool {
        self.queue().paused
    }

    /// Appends a file to the queue and starts it if nothing else is running.
    pub fn enqueue(&self, source: Arc<dyn UploadSource>, destination: Destination) -> Uuid {
        let file_size = source.len();
        let chunk_size = self.inner.chunk_size;
        let item = UploadItem {
            id: Uuid::new_v4(),
            file_name: source.name().to_string(),
            file_size,
            destination,
            session_id: None,
            chunk_size,
            total_chunks: progress::total_chunks(file_size, chunk_size),
            next_chunk_index: 0,
            state: UploadState::Queued,
            bytes_sent: 0,
            started_at: None,
            last_error: None,
            asset: None,
            resend: Vec::new(),
            bytes_per_second: 0.0,
            eta: None,
        };
        let id = item.id;

        info!(
            "📥 Queued {} ({} bytes, {} chunks) for {}",
            item.file_name, item.file_size, item.total_chunks, item.destination
        );

        let next = {
            let mut queue = self.queue();
            queue.entries.push(Entry {
                item,
                source,
                meter: None,
            });
            self.emit(UploadEvent::Enqueued { id });
            self.activate_next(&mut queue)
        };
        self.spawn_run(next);
        id
    }

    /// Starts the earliest queued item unless paused or something is active.
    pub fn drive(&self) {
        let next = self.activate_next(&mut self.queue());
        self.spawn_run(next);
    }

    /// Halts the scheduler and parks the active item.
    ///
    /// An in-flight chunk transfer is aborted and the item moves to `paused` right
    /// away. An in-flight init or complete call is allowed to finish first, so a
    /// session or artifact the receiver already created is not lost. Returns the
    /// item being paused, if one was active.
    pub fn pause(&self) -> Option<Uuid> {
        let mut queue = self.queue();
        queue.paused = true;

        let run = queue.active.as_mut()?;
        if !run.interruptible {
            run.pause_requested = true;
            debug!("Pause of {} deferred until its request returns", run.id);
            return Some(run.id);
        }

        let run = queue.active.take()?;
        run.token.cancel();
        self.park(&mut queue, run.id);
        Some(run.id)
    }

    /// Requeues the most recently paused item and re-engages the scheduler.
    ///
    /// A pause still waiting on an init or complete call is withdrawn instead.
    pub fn resume(&self) -> Option<Uuid> {
        let (resumed, next) = {
            let mut queue = self.queue();
            queue.paused = false;

            let mut resumed = None;
            if let Some(run) = queue.active.as_mut() {
                if run.pause_requested {
                    run.pause_requested = false;
                    resumed = Some(run.id);
                }
            }
            while resumed.is_none() {
                let Some(id) = queue.paused_stack.pop() else {
                    break;
                };
                if let Some(entry) = queue.entry_mut(id) {
                    if entry.item.state == UploadState::Paused {
                        self.set_state(&mut entry.item, UploadState::Queued);
                        resumed = Some(id);
                    }
                }
            }
            (resumed, self.activate_next(&mut queue))
        };
        self.spawn_run(next);
        resumed
    }

    /// Requeues a failed item. It continues from where it stopped.
    pub fn retry(&self, id: Uuid) -> bool {
        let next = {
            let mut queue = self.queue();
            let Some(entry) = queue.entry_mut(id) else {
                return false;
            };
            if entry.item.state != UploadState::Failed {
                return false;
            }
            entry.item.last_error = None;
            self.set_state(&mut entry.item, UploadState::Queued);
            self.activate_next(&mut queue)
        };
        self.spawn_run(next);
        true
    }

    /// Removes an item client-side. The server session is left to expire.
    pub fn cancel(&self, id: Uuid) -> bool {
        let next = {
            let mut queue = self.queue();
            let Some(pos) = queue.entries.iter().position(|e| e.item.id == id) else {
                return false;
            };

            let was_active = matches!(&queue.active, Some(run) if run.id == id);
            if was_active {
                if let Some(run) = queue.active.take() {
                    run.token.cancel();
                }
            }

            let entry = queue.entries.remove(pos);
            queue.paused_stack.retain(|p| *p != id);
            info!("🗑️  Cancelled {}", entry.item.file_name);
            self.emit(UploadEvent::Removed { id });

            if was_active {
                self.activate_next(&mut queue)
            } else {
                None
            }
        };
        self.spawn_run(next);
        true
    }

    /// Drops every item that has not completed and stops the active transfer.
    pub fn clear_queue(&self) -> usize {
        let mut queue = self.queue();
        if let Some(run) = queue.active.take() {
            run.token.cancel();
        }
        queue.paused = false;
        queue.paused_stack.clear();

        let (kept, removed): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut queue.entries)
            .into_iter()
            .partition(|e| e.item.state == UploadState::Completed);
        queue.entries = kept;

        for entry in &removed {
            self.emit(UploadEvent::Removed { id: entry.item.id });
        }
        if !removed.is_empty() {
            info!("🧹 Cleared {} uploads from the queue", removed.len());
        }
        removed.len()
    }

    /// Waits until no transfer is running.
    ///
    /// Since failures park the scheduler, this returns once the queue has drained,
    /// an item failed, or the scheduler was paused.
    pub async fn wait_until_settled(&self) {
        let mut events = self.subscribe();
        loop {
            if self.queue().active.is_none() {
                return;
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Runs the queue to its end, moving past failed items.
    ///
    /// Failed items stay failed for the caller to inspect. Returns early if the
    /// scheduler is paused.
    pub async fn drain(&self) {
        loop {
            self.wait_until_settled().await;
            {
                let queue = self.queue();
                let queued = queue
                    .entries
                    .iter()
                    .any(|e| e.item.state == UploadState::Queued);
                if queue.paused || !queued {
                    return;
                }
            }
            self.drive();
        }
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: UploadEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn set_state(&self, item: &mut UploadItem, to: UploadState) {
        let from = item.state;
        if from == to {
            return;
        }
        item.state = to;
        self.emit(UploadEvent::StateChanged {
            id: item.id,
            from,
            to,
        });
    }

    /// Moves the item to `paused` and remembers it for `resume`.
    fn park(&self, queue: &mut Queue, id: Uuid) {
        queue.paused_stack.push(id);
        if let Some(entry) = queue.entry_mut(id) {
            entry.meter = None;
            entry.item.bytes_per_second = 0.0;
            entry.item.eta = None;
            self.set_state(&mut entry.item, UploadState::Paused);
            info!(
                "⏸️  Paused {} at chunk {}/{}",
                entry.item.file_name, entry.item.next_chunk_index, entry.item.total_chunks
            );
        }
    }

    fn activate_next(&self, queue: &mut Queue) -> Option<(Uuid, CancellationToken)> {
        if queue.paused || queue.active.is_some() {
            return None;
        }

        let entry = queue
            .entries
            .iter_mut()
            .find(|e| e.item.state == UploadState::Queued)?;
        let id = entry.item.id;

        entry.item.started_at = Some(Utc::now());
        entry.item.bytes_per_second = 0.0;
        entry.item.eta = None;
        entry.meter = Some(ActivationMeter::start());
        self.set_state(&mut entry.item, UploadState::Active);
        info!(
            "🚀 Uploading {} from chunk {}/{}",
            entry.item.file_name, entry.item.next_chunk_index, entry.item.total_chunks
        );

        let token = CancellationToken::new();
        queue.active = Some(Run {
            id,
            token: token.clone(),
            interruptible: true,
            pause_requested: false,
        });
        Some((id, token))
    }

    fn spawn_run(&self, next: Option<(Uuid, CancellationToken)>) {
        if let Some((id, token)) = next {
            let this = self.clone();
            tokio::spawn(async move {
                let outcome = this.transfer(id, &token).await;
                this.finish(id, &token, outcome);
            });
        }
    }

    async fn call<T>(
        &self,
        token: &CancellationToken,
        fut: impl Future<Output = Result<T, TransferError>>,
    ) -> Result<T, TransferError> {
        let bounded = async {
            match self.inner.request_timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(res) => res,
                    Err(_) => Err(TransferError::Timeout(limit)),
                },
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransferError::Cancelled),
            res = bounded => res,
        }
    }

    fn plan(&self, id: Uuid, token: &CancellationToken) -> Result<Plan, TransferError> {
        let mut queue = self.queue();
        if !queue.is_current(id, token) {
            return Err(TransferError::Cancelled);
        }
        let entry = queue.entry_mut(id).ok_or(TransferError::Cancelled)?;
        Ok(Plan {
            source: entry.source.clone(),
            file_name: entry.item.file_name.clone(),
            file_size: entry.item.file_size,
            destination: entry.item.destination.clone(),
            session_id: entry.item.session_id.clone(),
            chunk_size: entry.item.chunk_size,
            total_chunks: entry.item.total_chunks,
            next_chunk_index: entry.item.next_chunk_index,
            resend: entry.item.resend.clone(),
        })
    }

    /// Marks whether `pause` may abort the run's next call. Fails once a deferred
    /// pause is due, so the run stops before starting anything new.
    fn enter_phase(
        &self,
        id: Uuid,
        token: &CancellationToken,
        interruptible: bool,
    ) -> Result<(), TransferError> {
        let mut queue = self.queue();
        if !queue.is_current(id, token) {
            return Err(TransferError::Cancelled);
        }
        let run = queue.active.as_mut().ok_or(TransferError::Cancelled)?;
        if run.pause_requested {
            return Err(TransferError::Cancelled);
        }
        run.interruptible = interruptible;
        Ok(())
    }

    /// Applies `f` to the item if this run still owns the active slot.
    fn update(
        &self,
        id: Uuid,
        token: &CancellationToken,
        f: impl FnOnce(&mut Entry),
    ) -> Result<(), TransferError> {
        let mut queue = self.queue();
        if !queue.is_current(id, token) {
            return Err(TransferError::Cancelled);
        }
        let entry = queue.entry_mut(id).ok_or(TransferError::Cancelled)?;
        f(entry);
        Ok(())
    }

    fn record_chunk(
        &self,
        id: Uuid,
        token: &CancellationToken,
        index: u32,
        len: u64,
    ) -> Result<(), TransferError> {
        let mut queue = self.queue();
        if !queue.is_current(id, token) {
            return Err(TransferError::Cancelled);
        }
        let entry = queue.entry_mut(id).ok_or(TransferError::Cancelled)?;

        let item = &mut entry.item;
        item.next_chunk_index = index + 1;
        item.bytes_sent = (item.bytes_sent + len).min(item.file_size);
        item.bytes_per_second = match entry.meter.as_mut() {
            Some(meter) => {
                meter.record(len);
                meter.bytes_per_second()
            }
            None => 0.0,
        };
        item.eta = progress::eta(item.file_size - item.bytes_sent, item.bytes_per_second);

        let event = UploadEvent::Progress {
            id,
            bytes_sent: item.bytes_sent,
            total_bytes: item.file_size,
            next_chunk_index: item.next_chunk_index,
            total_chunks: item.total_chunks,
            bytes_per_second: item.bytes_per_second,
            eta: item.eta,
        };
        self.emit(event);
        Ok(())
    }

    async fn read_chunk(&self, plan: &Plan, index: u32) -> Result<Bytes, TransferError> {
        let (start, end) = progress::chunk_bounds(index, plan.chunk_size, plan.file_size);
        Ok(plan.source.read_range(start, end).await?)
    }

    async fn transfer(
        &self,
        id: Uuid,
        token: &CancellationToken,
    ) -> Result<CompleteUploadResponse, TransferError> {
        let mut plan = self.plan(id, token)?;
        let transport = &self.inner.transport;

        let session_id = match plan.session_id.take() {
            Some(session_id) => session_id,
            None => {
                let req = InitUploadRequest {
                    file_name: plan.file_name.clone(),
                    total_chunks: plan.total_chunks,
                    destination: plan.destination.clone(),
                };
                self.enter_phase(id, token, false)?;
                let res = self.call(token, transport.init(&req)).await?;
                debug!("Session {} opened for {}", res.session_id, plan.file_name);
                let session_id = res.session_id;
                self.update(id, token, |entry| {
                    entry.item.session_id = Some(session_id.clone())
                })?;
                self.enter_phase(id, token, true)?;
                session_id
            }
        };

        for index in std::mem::take(&mut plan.resend) {
            let data = self.read_chunk(&plan, index).await?;
            self.call(token, transport.send_chunk(&session_id, index, data))
                .await?;
            self.update(id, token, |entry| {
                entry.item.resend.retain(|i| *i != index)
            })?;
        }

        for index in plan.next_chunk_index..plan.total_chunks {
            let data = self.read_chunk(&plan, index).await?;
            let len = data.len() as u64;
            self.call(token, transport.send_chunk(&session_id, index, data))
                .await?;
            self.record_chunk(id, token, index, len)?;
        }

        let req = CompleteUploadRequest {
            total_chunks: plan.total_chunks,
            file_name: plan.file_name.clone(),
        };
        self.enter_phase(id, token, false)?;
        self.call(token, transport.complete(&session_id, &req)).await
    }

    fn finish(
        &self,
        id: Uuid,
        token: &CancellationToken,
        outcome: Result<CompleteUploadResponse, TransferError>,
    ) {
        let next = {
            let mut queue = self.queue();
            if !queue.is_current(id, token) {
                // Paused, cancelled or cleared; that call already moved the item
                return;
            }
            let pause_requested = queue.active.take().is_some_and(|run| run.pause_requested);

            let Some(entry) = queue.entry_mut(id) else {
                return;
            };
            entry.meter = None;
            entry.item.eta = None;

            match outcome {
                Ok(asset) => {
                    info!(
                        "✅ {} uploaded: {} ({} bytes)",
                        entry.item.file_name, asset.asset_locator, asset.size
                    );
                    entry.item.bytes_sent = entry.item.file_size;
                    entry.item.asset = Some(asset);
                    self.set_state(&mut entry.item, UploadState::Completed);
                    self.activate_next(&mut queue)
                }
                Err(TransferError::Cancelled) if !pause_requested => {
                    self.set_state(&mut entry.item, UploadState::Queued);
                    None
                }
                Err(err) => {
                    forget_rejected_progress(&mut entry.item, &err);
                    if pause_requested {
                        self.park(&mut queue, id);
                    } else {
                        if err.is_transient() {
                            warn!(
                                "⚠️  Upload of {} interrupted at chunk {}: {}",
                                entry.item.file_name, entry.item.next_chunk_index, err
                            );
                        } else {
                            warn!("❌ Upload of {} failed: {}", entry.item.file_name, err);
                        }
                        entry.item.last_error = Some(err.to_string());
                        self.set_state(&mut entry.item, UploadState::Failed);
                    }
                    None
                }
            }
        };
        self.spawn_run(next);
    }
}

/// Applies what a receiver rejection says about the item's server-side progress.
fn forget_rejected_progress(item: &mut UploadItem, err: &TransferError) {
    match err.code() {
        Some(code) if code.requires_new_session() => {
            item.session_id = None;
            item.next_chunk_index = 0;
            item.bytes_sent = 0;
            item.resend.clear();
        }
        Some(ErrorCode::IncompleteUpload) => {
            item.resend = err.missing_chunks().to_vec();
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::source::MemorySource;
    use crate::models::{ChunkAck, InitUploadResponse};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockTransport {
        calls: Mutex<Vec<String>>,
        chunks: Mutex<HashMap<(String, u32), Bytes>>,
        sessions: AtomicU32,
        fail_init: AtomicBool,
        fail_chunk_once: Mutex<Option<u32>>,
        hold_chunk_once: Mutex<Option<u32>>,
        held: Notify,
        missing_once: Mutex<Vec<u32>>,
        expire_once: AtomicBool,
        /// Init or complete takes effect, then its response waits for `release`.
        hold_init_once: AtomicBool,
        hold_complete_once: AtomicBool,
        release: Notify,
    }

    impl MockTransport {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn assembled(&self, session_id: &str, total_chunks: u32) -> Vec<u8> {
            let chunks = self.chunks.lock().unwrap();
            (0..total_chunks)
                .flat_map(|i| chunks[&(session_id.to_string(), i)].to_vec())
                .collect()
        }
    }

    #[async_trait]
    impl UploadTransport for MockTransport {
        async fn init(&self, req: &InitUploadRequest) -> Result<InitUploadResponse, TransferError> {
            self.calls.lock().unwrap().push("init".to_string());
            if self.fail_init.load(Ordering::SeqCst) {
                return Err(TransferError::Rejected {
                    status: Some(400),
                    code: ErrorCode::InvalidDestination,
                    message: "no such lecture".to_string(),
                    missing_chunks: Vec::new(),
                });
            }
            let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hold_init_once.swap(false, Ordering::SeqCst) {
                self.held.notify_one();
                self.release.notified().await;
            }
            Ok(InitUploadResponse {
                session_id: format!("s{}", n),
                total_chunks: req.total_chunks,
                expires_at: Utc::now(),
            })
        }

        async fn send_chunk(
            &self,
            session_id: &str,
            chunk_index: u32,
            data: Bytes,
        ) -> Result<ChunkAck, TransferError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", session_id, chunk_index));

            let hold = {
                let mut hold = self.hold_chunk_once.lock().unwrap();
                if *hold == Some(chunk_index) {
                    hold.take()
                } else {
                    None
                }
            };
            if hold.is_some() {
                self.held.notify_one();
                return std::future::pending().await;
            }

            let fail = {
                let mut fail = self.fail_chunk_once.lock().unwrap();
                if *fail == Some(chunk_index) {
                    fail.take()
                } else {
                    None
                }
            };
            if fail.is_some() {
                return Err(TransferError::Network("connection reset".to_string()));
            }

            let mut chunks = self.chunks.lock().unwrap();
            chunks.insert((session_id.to_string(), chunk_index), data);
            Ok(ChunkAck {
                session_id: session_id.to_string(),
                chunk_index,
                received_chunks: chunks.keys().filter(|(s, _)| s == session_id).count() as u32,
            })
        }

        async fn complete(
            &self,
            session_id: &str,
            req: &CompleteUploadRequest,
        ) -> Result<CompleteUploadResponse, TransferError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:complete", session_id));

            if self.expire_once.swap(false, Ordering::SeqCst) {
                return Err(TransferError::Rejected {
                    status: Some(410),
                    code: ErrorCode::SessionExpired,
                    message: "session expired".to_string(),
                    missing_chunks: Vec::new(),
                });
            }

            let missing = std::mem::take(&mut *self.missing_once.lock().unwrap());
            if !missing.is_empty() {
                return Err(TransferError::Rejected {
                    status: Some(409),
                    code: ErrorCode::IncompleteUpload,
                    message: "incomplete".to_string(),
                    missing_chunks: missing,
                });
            }

            let size = self.assembled(session_id, req.total_chunks).len() as u64;
            if self.hold_complete_once.swap(false, Ordering::SeqCst) {
                self.held.notify_one();
                self.release.notified().await;
            }
            Ok(CompleteUploadResponse {
                asset_locator: format!("/media/{}", session_id),
                file_name: req.file_name.clone(),
                size,
                checksum: String::new(),
            })
        }
    }

    fn dest() -> Destination {
        Destination::new("rust-101", "week-1", "intro")
    }

    fn source(name: &str, len: usize) -> Arc<dyn UploadSource> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Arc::new(MemorySource::new(name, data))
    }

    fn transitions(rx: &mut broadcast::Receiver<UploadEvent>) -> Vec<(UploadState, UploadState)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let UploadEvent::StateChanged { from, to, .. } = event {
                out.push((from, to));
            }
        }
        out
    }

    #[tokio::test]
    async fn test_pause_resume_continues_from_next_chunk() {
        let transport = Arc::new(MockTransport::default());
        *transport.hold_chunk_once.lock().unwrap() = Some(2);
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);
        let mut events = orchestrator.subscribe();

        let src = source("lecture.mp4", 10);
        let id = orchestrator.enqueue(src, dest());
        transport.held.notified().await;

        assert_eq!(orchestrator.pause(), Some(id));
        let paused = orchestrator.item(id).unwrap();
        assert_eq!(paused.state, UploadState::Paused);
        assert_eq!(paused.next_chunk_index, 2);
        assert_eq!(paused.session_id.as_deref(), Some("s1"));
        assert!(paused.last_error.is_none());

        assert_eq!(orchestrator.resume(), Some(id));
        orchestrator.wait_until_settled().await;

        let done = orchestrator.item(id).unwrap();
        assert_eq!(done.state, UploadState::Completed);
        assert_eq!(done.asset.unwrap().size, 10);
        assert_eq!(
            transport.calls(),
            vec!["init", "s1:0", "s1:1", "s1:2", "s1:2", "s1:complete"]
        );
        let expected: Vec<u8> = (0..10u8).collect();
        assert_eq!(transport.assembled("s1", 3), expected);

        use UploadState::*;
        assert_eq!(
            transitions(&mut events),
            vec![
                (Queued, Active),
                (Active, Paused),
                (Paused, Queued),
                (Queued, Active),
                (Active, Completed)
            ]
        );
    }

    #[tokio::test]
    async fn test_network_failure_parks_queue_until_retry() {
        let transport = Arc::new(MockTransport::default());
        *transport.fail_chunk_once.lock().unwrap() = Some(1);
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);

        let first = orchestrator.enqueue(source("a.mp4", 12), dest());
        let second = orchestrator.enqueue(source("b.mp4", 4), dest());
        orchestrator.wait_until_settled().await;

        let failed = orchestrator.item(first).unwrap();
        assert_eq!(failed.state, UploadState::Failed);
        assert_eq!(failed.next_chunk_index, 1);
        assert!(failed.last_error.unwrap().contains("connection reset"));
        assert_eq!(orchestrator.item(second).unwrap().state, UploadState::Queued);

        // The second item follows in the same run once the retried one completes
        assert!(orchestrator.retry(first));
        orchestrator.wait_until_settled().await;

        let retried = orchestrator.item(first).unwrap();
        assert_eq!(retried.state, UploadState::Completed);
        assert!(retried.last_error.is_none());
        assert_eq!(orchestrator.item(second).unwrap().state, UploadState::Completed);

        let calls = transport.calls();
        assert_eq!(calls.iter().filter(|c| *c == "s1:0").count(), 1);
        assert_eq!(calls.iter().filter(|c| *c == "s1:1").count(), 2);
    }

    #[tokio::test]
    async fn test_at_most_one_item_active() {
        let transport = Arc::new(MockTransport::default());
        let orchestrator = UploadOrchestrator::new(transport.clone(), 3);
        let mut events = orchestrator.subscribe();

        let ids: Vec<Uuid> = (0..4)
            .map(|i| orchestrator.enqueue(source(&format!("{}.mp4", i), 7 + i), dest()))
            .collect();

        let mut active = 0i32;
        let mut completed = 0;
        while completed < ids.len() {
            if let UploadEvent::StateChanged { from, to, .. } = events.recv().await.unwrap() {
                if to == UploadState::Active {
                    active += 1;
                }
                if from == UploadState::Active {
                    active -= 1;
                }
                assert!(active <= 1, "two items active at once");
                if to == UploadState::Completed {
                    completed += 1;
                }
            }
        }

        let snapshot = orchestrator.snapshot();
        assert!(snapshot.iter().all(|i| i.state == UploadState::Completed));
        // FIFO
        let order: Vec<String> = transport
            .calls()
            .into_iter()
            .filter(|c| c.ends_with(":complete"))
            .collect();
        assert_eq!(order, vec!["s1:complete", "s2:complete", "s3:complete", "s4:complete"]);
    }

    #[tokio::test]
    async fn test_incomplete_upload_resends_exactly_missing_chunks() {
        let transport = Arc::new(MockTransport::default());
        *transport.missing_once.lock().unwrap() = vec![1];
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);

        let id = orchestrator.enqueue(source("a.mp4", 12), dest());
        orchestrator.wait_until_settled().await;

        let failed = orchestrator.item(id).unwrap();
        assert_eq!(failed.state, UploadState::Failed);
        assert_eq!(failed.resend, vec![1]);

        let before = transport.calls().len();
        assert!(orchestrator.retry(id));
        orchestrator.wait_until_settled().await;

        assert_eq!(orchestrator.item(id).unwrap().state, UploadState::Completed);
        assert_eq!(transport.calls()[before..], ["s1:1", "s1:complete"]);
    }

    #[tokio::test]
    async fn test_expired_session_restarts_with_fresh_init() {
        let transport = Arc::new(MockTransport::default());
        transport.expire_once.store(true, Ordering::SeqCst);
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);

        let id = orchestrator.enqueue(source("a.mp4", 8), dest());
        orchestrator.wait_until_settled().await;

        let failed = orchestrator.item(id).unwrap();
        assert_eq!(failed.state, UploadState::Failed);
        assert_eq!(failed.session_id, None);
        assert_eq!(failed.next_chunk_index, 0);
        assert_eq!(failed.bytes_sent, 0);

        orchestrator.retry(id);
        orchestrator.wait_until_settled().await;

        let done = orchestrator.item(id).unwrap();
        assert_eq!(done.state, UploadState::Completed);
        assert_eq!(done.asset.unwrap().asset_locator, "/media/s2");
    }

    #[tokio::test]
    async fn test_init_failure_surfaces_server_message() {
        let transport = Arc::new(MockTransport::default());
        transport.fail_init.store(true, Ordering::SeqCst);
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);

        let id = orchestrator.enqueue(source("a.mp4", 8), dest());
        orchestrator.wait_until_settled().await;

        let item = orchestrator.item(id).unwrap();
        assert_eq!(item.state, UploadState::Failed);
        assert_eq!(item.last_error.as_deref(), Some("no such lecture"));
        assert_eq!(transport.calls(), vec!["init"]);
    }

    #[tokio::test]
    async fn test_cancel_active_item_advances_queue() {
        let transport = Arc::new(MockTransport::default());
        *transport.hold_chunk_once.lock().unwrap() = Some(0);
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);

        let first = orchestrator.enqueue(source("a.mp4", 8), dest());
        let second = orchestrator.enqueue(source("b.mp4", 8), dest());
        transport.held.notified().await;

        assert!(orchestrator.cancel(first));
        assert!(orchestrator.item(first).is_none());
        orchestrator.wait_until_settled().await;

        assert_eq!(orchestrator.item(second).unwrap().state, UploadState::Completed);
        assert!(!orchestrator.cancel(first));
    }

    #[tokio::test]
    async fn test_paused_scheduler_holds_queue_and_clear_removes_pending() {
        let transport = Arc::new(MockTransport::default());
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);

        assert_eq!(orchestrator.pause(), None);
        assert!(orchestrator.is_paused());

        let a = orchestrator.enqueue(source("a.mp4", 4), dest());
        orchestrator.enqueue(source("b.mp4", 4), dest());
        let snapshot = orchestrator.snapshot();
        assert!(snapshot.iter().all(|i| i.state == UploadState::Queued));
        assert!(snapshot.iter().all(|i| i.eta.is_none()));
        assert!(transport.calls().is_empty());

        assert!(orchestrator.cancel(a));
        assert_eq!(orchestrator.clear_queue(), 1);
        assert!(orchestrator.snapshot().is_empty());
        assert!(!orchestrator.is_paused());
    }

    #[tokio::test]
    async fn test_empty_file_is_sent_as_one_empty_chunk() {
        let transport = Arc::new(MockTransport::default());
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);

        let id = orchestrator.enqueue(source("empty.mp4", 0), dest());
        orchestrator.wait_until_settled().await;

        let item = orchestrator.item(id).unwrap();
        assert_eq!(item.total_chunks, 1);
        assert_eq!(item.state, UploadState::Completed);
        assert_eq!(transport.calls(), vec!["init", "s1:0", "s1:complete"]);
    }

    #[tokio::test]
    async fn test_pause_during_complete_keeps_the_asset() {
        let transport = Arc::new(MockTransport::default());
        transport.hold_complete_once.store(true, Ordering::SeqCst);
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);
        let mut events = orchestrator.subscribe();

        let id = orchestrator.enqueue(source("a.mp4", 10), dest());
        let next = orchestrator.enqueue(source("b.mp4", 4), dest());
        transport.held.notified().await;

        // The receiver has assembled the file; the response is still in flight
        assert_eq!(orchestrator.pause(), Some(id));
        assert_eq!(orchestrator.item(id).unwrap().state, UploadState::Active);

        transport.release.notify_one();
        orchestrator.wait_until_settled().await;

        let done = orchestrator.item(id).unwrap();
        assert_eq!(done.state, UploadState::Completed);
        assert_eq!(done.asset.unwrap().asset_locator, "/media/s1");
        assert!(done.last_error.is_none());

        // The scheduler stays paused, so the next file has not started
        assert!(orchestrator.is_paused());
        assert_eq!(orchestrator.item(next).unwrap().state, UploadState::Queued);
        assert_eq!(
            transport
                .calls()
                .iter()
                .filter(|c| c.ends_with(":complete"))
                .count(),
            1
        );

        use UploadState::*;
        assert_eq!(
            transitions(&mut events),
            vec![(Queued, Active), (Active, Completed)]
        );

        assert_eq!(orchestrator.resume(), None);
        orchestrator.wait_until_settled().await;
        assert_eq!(orchestrator.item(next).unwrap().state, UploadState::Completed);
    }

    #[tokio::test]
    async fn test_resume_before_complete_returns_carries_on() {
        let transport = Arc::new(MockTransport::default());
        transport.hold_complete_once.store(true, Ordering::SeqCst);
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);

        let id = orchestrator.enqueue(source("a.mp4", 6), dest());
        transport.held.notified().await;

        assert_eq!(orchestrator.pause(), Some(id));
        assert_eq!(orchestrator.resume(), Some(id));
        assert!(!orchestrator.is_paused());

        transport.release.notify_one();
        orchestrator.wait_until_settled().await;

        assert_eq!(orchestrator.item(id).unwrap().state, UploadState::Completed);
        assert_eq!(transport.calls(), vec!["init", "s1:0", "s1:1", "s1:complete"]);
    }

    #[tokio::test]
    async fn test_pause_during_init_keeps_the_session() {
        let transport = Arc::new(MockTransport::default());
        transport.hold_init_once.store(true, Ordering::SeqCst);
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);

        let id = orchestrator.enqueue(source("a.mp4", 8), dest());
        transport.held.notified().await;

        assert_eq!(orchestrator.pause(), Some(id));
        transport.release.notify_one();
        orchestrator.wait_until_settled().await;

        let paused = orchestrator.item(id).unwrap();
        assert_eq!(paused.state, UploadState::Paused);
        assert_eq!(paused.session_id.as_deref(), Some("s1"));
        assert_eq!(paused.next_chunk_index, 0);
        assert!(paused.last_error.is_none());
        assert_eq!(transport.calls(), vec!["init"]);

        assert_eq!(orchestrator.resume(), Some(id));
        orchestrator.wait_until_settled().await;

        assert_eq!(orchestrator.item(id).unwrap().state, UploadState::Completed);
        assert_eq!(transport.calls(), vec!["init", "s1:0", "s1:1", "s1:complete"]);
    }

    #[tokio::test]
    async fn test_drain_moves_past_failures() {
        let transport = Arc::new(MockTransport::default());
        *transport.fail_chunk_once.lock().unwrap() = Some(0);
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);

        // Nobody listens for events, so nothing but drain restarts the queue
        let first = orchestrator.enqueue(source("a.mp4", 4), dest());
        let second = orchestrator.enqueue(source("b.mp4", 4), dest());
        let third = orchestrator.enqueue(source("c.mp4", 4), dest());
        orchestrator.drain().await;

        assert_eq!(orchestrator.item(first).unwrap().state, UploadState::Failed);
        assert_eq!(orchestrator.item(second).unwrap().state, UploadState::Completed);
        assert_eq!(orchestrator.item(third).unwrap().state, UploadState::Completed);
    }

    #[tokio::test]
    async fn test_drain_returns_while_paused() {
        let transport = Arc::new(MockTransport::default());
        let orchestrator = UploadOrchestrator::new(transport.clone(), 4);

        orchestrator.pause();
        let id = orchestrator.enqueue(source("a.mp4", 4), dest());
        orchestrator.drain().await;

        assert_eq!(orchestrator.item(id).unwrap().state, UploadState::Queued);
        assert!(transport.calls().is_empty());
    }
}
