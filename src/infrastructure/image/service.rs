//! Async image loading engine.
//!
//! Implements a three-tier lookup: Memory -> Disk -> Source. A single worker
//! loop owns the priority queue; every cache key has at most one fetch in
//! flight and late requests for the same key join it.

use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

use crate::domain::entities::{
    CacheKey, CachePolicy, CacheTier, ImageOrigin, ImagePayload, ImageSource, LoadedImage,
    Priority, ScheduledTask, Transformation, WorkHandle,
};
use crate::domain::errors::LoadError;
use crate::domain::ports::{CacheResult, ImageCachePort, ImageFetcher, LoadEngine};

use super::disk_cache::{DEFAULT_MAX_CACHE_SIZE, DiskImageCache};
use super::fetcher::{DEFAULT_USER_AGENT, SourceFetcher};
use super::memory_cache::{CacheStats, DEFAULT_CACHE_SIZE, MemoryImageCache};

/// Configuration for the image service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageServiceConfig {
    /// Maximum images in memory cache.
    pub memory_cache_size: usize,
    /// Maximum disk cache size in bytes.
    pub disk_cache_size: u64,
    /// Maximum loads running at once.
    pub max_concurrent_loads: usize,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Extra attempts after a retryable fetch error.
    pub retry_count: u32,
    /// Delay between fetch attempts in milliseconds.
    pub retry_delay_ms: u64,
    /// Disk cache directory. Defaults to the platform cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Directory bundle sources resolve against. Defaults to the working directory.
    pub bundle_dir: Option<PathBuf>,
    /// User agent for remote fetches.
    pub user_agent: String,
}

impl Default for ImageServiceConfig {
    fn default() -> Self {
        Self {
            memory_cache_size: DEFAULT_CACHE_SIZE,
            disk_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_concurrent_loads: 4,
            timeout_secs: 30,
            retry_count: 3,
            retry_delay_ms: 250,
            cache_dir: None,
            bundle_dir: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Snapshot of engine activity.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Memory tier statistics.
    pub memory: CacheStats,
    /// Number of disk entries.
    pub disk_entries: usize,
    /// Disk usage in bytes.
    pub disk_bytes: u64,
    /// Keys queued or running.
    pub pending: usize,
    /// Source fetch attempts made.
    pub fetches: u64,
    /// Loads completed, successfully or not.
    pub completed: u64,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.memory)?;
        writeln!(
            f,
            "Disk: {} entries, {} bytes",
            self.disk_entries, self.disk_bytes
        )?;
        write!(
            f,
            "Loads: {} pending, {} completed, {} fetch attempts",
            self.pending, self.completed, self.fetches
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
}

/// Work registered for one cache key.
struct InFlight {
    id: u64,
    phase: Phase,
    priority: Priority,
    decode: bool,
    /// Tiers wanted by any waiter, joiners of a running load included.
    policy: CachePolicy,
    waiters: Vec<Arc<ScheduledTask>>,
    /// Decode requests that arrived while a bytes-only load was running.
    deferred: Vec<Arc<ScheduledTask>>,
    abort: Option<AbortHandle>,
}

impl InFlight {
    fn new(id: u64, task: Arc<ScheduledTask>) -> Self {
        Self {
            id,
            phase: Phase::Queued,
            priority: task.priority(),
            decode: task.wants_decoded(),
            policy: task.cache(),
            waiters: vec![task],
            deferred: Vec::new(),
            abort: None,
        }
    }

    /// Drops cancelled tasks, returns true if anyone is still waiting.
    fn prune_cancelled(&mut self) -> bool {
        self.waiters.retain(|t| !t.is_cancelled());
        self.deferred.retain(|t| !t.is_cancelled());
        !self.waiters.is_empty() || !self.deferred.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    priority: Priority,
    seq: Reverse<u64>,
    key: CacheKey,
    flight: u64,
}

enum Command {
    Load(Arc<ScheduledTask>),
    CancelAll,
}

struct Shared {
    memory_cache: Arc<MemoryImageCache>,
    disk_cache: Arc<DiskImageCache>,
    fetcher: Arc<dyn ImageFetcher>,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
    config: ImageServiceConfig,
    fetches: AtomicU64,
    completed: AtomicU64,
}

/// Shared image loading engine.
///
/// Cloning is cheap, all clones drive the same worker. The worker stops
/// once every clone is dropped.
#[derive(Clone)]
pub struct ImageService {
    shared: Arc<Shared>,
    command_tx: mpsc::UnboundedSender<Command>,
    cancel_tx: mpsc::UnboundedSender<CacheKey>,
}

impl std::fmt::Debug for ImageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageService")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl ImageService {
    /// Creates a service and spawns its worker on the current runtime.
    #[must_use]
    pub fn new(
        config: ImageServiceConfig,
        disk_cache: Arc<DiskImageCache>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        let memory_cache = Arc::new(MemoryImageCache::new(config.memory_cache_size));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_loads.max(1)));

        let shared = Arc::new(Shared {
            memory_cache,
            disk_cache,
            fetcher,
            in_flight: Mutex::new(HashMap::new()),
            config,
            fetches: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        });

        let worker = Worker {
            shared: shared.clone(),
            command_rx,
            cancel_rx,
            resubmit_tx: command_tx.downgrade(),
            semaphore,
            queue: BinaryHeap::new(),
            seq: 0,
        };
        tokio::spawn(worker.run());

        Self {
            shared,
            command_tx,
            cancel_tx,
        }
    }

    /// Creates a service with a disk cache and source fetcher built from
    /// the configuration.
    ///
    /// # Errors
    /// Returns error if the disk cache or HTTP client cannot be created.
    pub async fn from_config(config: ImageServiceConfig) -> CacheResult<Self> {
        let disk_cache = match &config.cache_dir {
            Some(dir) => DiskImageCache::new(dir.clone(), config.disk_cache_size).await?,
            None => DiskImageCache::default_location(config.disk_cache_size).await?,
        };
        let fetcher = SourceFetcher::new(
            Duration::from_secs(config.timeout_secs),
            &config.user_agent,
            config.bundle_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
        )?;
        Ok(Self::new(config, Arc::new(disk_cache), Arc::new(fetcher)))
    }

    /// Submits a task. Completion is delivered through the task's observers
    /// and target.
    pub fn load_image(&self, task: ScheduledTask) {
        task.handle().attach_canceller(self.cancel_tx.clone());
        trace!(key = %task.key(), priority = ?task.priority(), "Submitting image load");
        if let Err(e) = self.command_tx.send(Command::Load(Arc::new(task))) {
            error!("Failed to submit image load: {}", e);
        }
    }

    /// Removes a key from the given tiers. Absent entries are not an error.
    ///
    /// # Errors
    /// Returns error if a disk entry exists but cannot be removed.
    pub async fn invalidate_cache_entry(&self, key: &CacheKey, tier: CacheTier) -> CacheResult<()> {
        let mut removed = false;
        if tier.includes_memory() {
            removed |= self.shared.memory_cache.evict(key).await;
        }
        if tier.includes_disk() {
            removed |= self.shared.disk_cache.evict(key).await?;
        }
        info!(key = %key, tier = %tier, removed = removed, "Invalidated cache entry");
        Ok(())
    }

    /// Cancels one piece of work.
    pub fn cancel(&self, work: &WorkHandle) {
        work.cancel();
    }

    /// Cancels every queued and running load.
    pub fn cancel_all(&self) {
        if let Err(e) = self.command_tx.send(Command::CancelAll) {
            error!("Failed to send cancel all request: {}", e);
        }
    }

    /// Clears the given tiers.
    ///
    /// # Errors
    /// Returns error if the disk cache directory cannot be read.
    pub async fn clear(&self, tier: CacheTier) -> CacheResult<()> {
        if tier.includes_memory() {
            self.shared.memory_cache.clear().await;
        }
        if tier.includes_disk() {
            self.shared.disk_cache.clear().await?;
        }
        info!(tier = %tier, "Cleared image caches");
        Ok(())
    }

    /// Returns true if the key is present in the given tier.
    pub async fn is_cached(&self, key: &CacheKey, tier: CacheTier) -> bool {
        let in_memory = tier.includes_memory() && self.shared.memory_cache.contains(key);
        let on_disk = tier.includes_disk() && self.shared.disk_cache.contains(key).await;
        match tier {
            CacheTier::All => in_memory && on_disk,
            CacheTier::Memory | CacheTier::Disk => in_memory || on_disk,
        }
    }

    /// Returns the number of keys queued or running.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Returns true if a load for the key is queued or running.
    #[must_use]
    pub fn is_loading(&self, key: &CacheKey) -> bool {
        self.shared.in_flight.lock().contains_key(key)
    }

    /// Returns the number of tasks waiting on a key, deferred ones included.
    #[must_use]
    pub fn waiter_count(&self, key: &CacheKey) -> usize {
        self.shared
            .in_flight
            .lock()
            .get(key)
            .map_or(0, |f| f.waiters.len() + f.deferred.len())
    }

    /// Returns engine statistics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            memory: self.shared.memory_cache.stats(),
            disk_entries: self.shared.disk_cache.len(),
            disk_bytes: self.shared.disk_cache.current_size(),
            pending: self.pending_count(),
            fetches: self.shared.fetches.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl LoadEngine for ImageService {
    fn load_image(&self, task: ScheduledTask) {
        Self::load_image(self, task);
    }

    async fn invalidate_cache_entry(&self, key: &CacheKey, tier: CacheTier) -> CacheResult<()> {
        Self::invalidate_cache_entry(self, key, tier).await
    }
}

/// State for the background worker loop.
struct Worker {
    shared: Arc<Shared>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    cancel_rx: mpsc::UnboundedReceiver<CacheKey>,
    resubmit_tx: mpsc::WeakUnboundedSender<Command>,
    semaphore: Arc<Semaphore>,
    queue: BinaryHeap<QueueEntry>,
    seq: u64,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(Command::Load(task)) => self.enqueue(task),
                        Some(Command::CancelAll) => self.cancel_all(),
                        None => break,
                    }
                }
                Some(key) = self.cancel_rx.recv() => self.prune(&key),
                Ok(permit) = self.semaphore.clone().acquire_owned(), if !self.queue.is_empty() => {
                    self.launch_next(permit);
                }
            }
        }
        debug!("Image service worker stopped");
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push(&mut self, key: CacheKey, priority: Priority, flight: u64) {
        let seq = self.next_seq();
        self.queue.push(QueueEntry {
            priority,
            seq: Reverse(seq),
            key,
            flight,
        });
    }

    fn enqueue(&mut self, task: Arc<ScheduledTask>) {
        if task.is_cancelled() {
            trace!(key = %task.key(), "Ignoring cancelled task");
            return;
        }

        let key = task.key().clone();
        let priority = task.priority();
        let flight_id = self.next_seq();
        let mut schedule = None;

        {
            let mut in_flight = self.shared.in_flight.lock();
            match in_flight.entry(key.clone()) {
                Entry::Occupied(mut occupied) => {
                    let flight = occupied.get_mut();
                    match flight.phase {
                        Phase::Queued => {
                            flight.decode |= task.wants_decoded();
                            flight.policy = flight.policy.union(task.cache());
                            flight.waiters.push(task);
                            if priority > flight.priority {
                                flight.priority = priority;
                                schedule = Some((priority, flight.id));
                            }
                            debug!(key = %key, waiters = flight.waiters.len(), "Joined queued load");
                        }
                        Phase::Running if task.wants_decoded() && !flight.decode => {
                            flight.deferred.push(task);
                            debug!(key = %key, "Deferred until running download completes");
                        }
                        Phase::Running => {
                            flight.policy = flight.policy.union(task.cache());
                            flight.waiters.push(task);
                            debug!(key = %key, waiters = flight.waiters.len(), "Joined running load");
                        }
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(InFlight::new(flight_id, task));
                    schedule = Some((priority, flight_id));
                }
            }
        }

        if let Some((priority, flight)) = schedule {
            debug!(key = %key, priority = ?priority, queued = self.queue.len() + 1, "Queued image load");
            self.push(key, priority, flight);
        }
    }

    fn launch_next(&mut self, permit: OwnedSemaphorePermit) {
        while let Some(entry) = self.queue.pop() {
            let job = {
                let mut in_flight = self.shared.in_flight.lock();
                let Some(flight) = in_flight.get_mut(&entry.key) else {
                    continue;
                };
                // Left behind by a priority bump, an earlier load of the key,
                // or a load that already started.
                if flight.id != entry.flight
                    || flight.phase != Phase::Queued
                    || flight.priority != entry.priority
                {
                    continue;
                }
                flight.prune_cancelled();
                if flight.waiters.is_empty() {
                    in_flight.remove(&entry.key);
                    debug!(key = %entry.key, "Abandoned load with no remaining waiters");
                    continue;
                }
                flight.phase = Phase::Running;
                Job::for_flight(self.shared.clone(), &entry.key, flight, self.resubmit_tx.clone())
            };

            let flight_id = job.flight_id;
            let handle = tokio::spawn(job.run(permit));
            if let Some(flight) = self.shared.in_flight.lock().get_mut(&entry.key)
                && flight.id == flight_id
            {
                flight.abort = Some(handle.abort_handle());
            }
            return;
        }
    }

    fn prune(&mut self, key: &CacheKey) {
        let mut in_flight = self.shared.in_flight.lock();
        let Some(flight) = in_flight.get_mut(key) else {
            return;
        };
        if flight.prune_cancelled() {
            return;
        }
        if let Some(abort) = flight.abort.take() {
            abort.abort();
            debug!(key = %key, "Aborted running load with no remaining waiters");
        } else {
            debug!(key = %key, "Dropped queued load with no remaining waiters");
        }
        in_flight.remove(key);
    }

    fn cancel_all(&mut self) {
        let flights: Vec<InFlight> = self
            .shared
            .in_flight
            .lock()
            .drain()
            .map(|(_, flight)| flight)
            .collect();
        self.queue.clear();

        let count = flights.len();
        for flight in flights {
            for task in flight.waiters.iter().chain(&flight.deferred) {
                task.handle().cancel();
            }
            if let Some(abort) = flight.abort {
                abort.abort();
            }
        }
        if count > 0 {
            info!(count = count, "Cancelled all pending image loads");
        }
    }
}

/// Outcome of a successful load, with fetched bytes not yet on disk.
struct Resolved {
    image: LoadedImage,
    fetched: Option<Bytes>,
}

/// One running load for one key.
struct Job {
    shared: Arc<Shared>,
    flight_id: u64,
    key: CacheKey,
    source: ImageSource,
    transformations: Vec<Transformation>,
    policy: CachePolicy,
    decode: bool,
    resubmit_tx: mpsc::WeakUnboundedSender<Command>,
}

impl Job {
    fn for_flight(
        shared: Arc<Shared>,
        key: &CacheKey,
        flight: &InFlight,
        resubmit_tx: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        // Every waiter shares the key, hence the same source and transformations.
        let template = flight.waiters[0].request();

        Self {
            shared,
            flight_id: flight.id,
            key: key.clone(),
            source: template.source().clone(),
            transformations: template.transformations().to_vec(),
            policy: flight.policy,
            decode: flight.decode,
            resubmit_tx,
        }
    }

    async fn run(self, permit: OwnedSemaphorePermit) {
        let outcome = self.resolve().await;
        let stored = match &outcome {
            Ok(resolved) => {
                let policy = self.flight_policy();
                self.store(resolved, policy).await;
                policy
            }
            Err(_) => CachePolicy::None,
        };
        drop(permit);

        let Some(flight) = self.take_flight() else {
            return;
        };
        // Tasks may have joined with wider policies while the first store ran.
        if let Ok(resolved) = &outcome {
            let missing = flight.policy.without(stored);
            if missing != CachePolicy::None {
                debug!(key = %self.key, policy = ?missing, "Caching for late joiners");
                self.store(resolved, missing).await;
            }
        }
        self.finish(flight, outcome.map(|resolved| resolved.image));
    }

    async fn resolve(&self) -> Result<Resolved, LoadError> {
        if self.decode
            && self.policy.uses_memory()
            && let Some(image) = self.shared.memory_cache.get(&self.key).await
        {
            return Ok(self.resolved(
                ImagePayload::Decoded(image),
                ImageOrigin::MemoryCache,
                None,
            ));
        }

        if self.policy.uses_disk()
            && let Some(bytes) = self.shared.disk_cache.get_bytes(&self.key).await
        {
            if !self.decode {
                return Ok(self.resolved(
                    ImagePayload::Encoded(bytes),
                    ImageOrigin::DiskCache,
                    None,
                ));
            }
            match decode(bytes, self.transformations.clone()).await {
                Ok(image) => {
                    return Ok(self.resolved(
                        ImagePayload::Decoded(Arc::new(image)),
                        ImageOrigin::DiskCache,
                        None,
                    ));
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Discarding corrupt disk cache entry");
                    if let Err(e) = self.shared.disk_cache.evict(&self.key).await {
                        warn!(key = %self.key, error = %e, "Failed to evict corrupt entry");
                    }
                }
            }
        }

        let bytes = self.fetch_with_retry().await?;
        let origin = ImageOrigin::for_source(self.source.kind());

        if !self.decode {
            return Ok(self.resolved(
                ImagePayload::Encoded(bytes.clone()),
                origin,
                Some(bytes),
            ));
        }

        match decode(bytes.clone(), self.transformations.clone()).await {
            Ok(image) => Ok(self.resolved(
                ImagePayload::Decoded(Arc::new(image)),
                origin,
                Some(bytes),
            )),
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    async fn fetch_with_retry(&self) -> Result<Bytes, LoadError> {
        let mut attempt = 0;
        loop {
            self.shared.fetches.fetch_add(1, Ordering::Relaxed);
            match self.shared.fetcher.fetch(&self.source).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    self.report(&e);
                    if !e.is_retryable() || attempt >= self.shared.config.retry_count {
                        return Err(e);
                    }
                    attempt += 1;
                    debug!(key = %self.key, attempt = attempt, error = %e, "Retrying image fetch");
                    tokio::time::sleep(Duration::from_millis(self.shared.config.retry_delay_ms))
                        .await;
                }
            }
        }
    }

    /// Tiers the flight wants now, falling back to those known at launch.
    fn flight_policy(&self) -> CachePolicy {
        self.shared
            .in_flight
            .lock()
            .get(&self.key)
            .filter(|f| f.id == self.flight_id)
            .map_or(self.policy, |f| f.policy)
    }

    /// Writes fetched bytes to disk and decoded images to memory, limited to
    /// the tiers in `policy`. Bytes reach disk only once decoding succeeded.
    async fn store(&self, resolved: &Resolved, policy: CachePolicy) {
        if policy.uses_disk()
            && let Some(bytes) = &resolved.fetched
            && let Err(e) = self.shared.disk_cache.put_bytes(&self.key, bytes).await
        {
            warn!(key = %self.key, error = %e, "Failed to cache to disk");
        }
        if policy.uses_memory()
            && resolved.image.origin != ImageOrigin::MemoryCache
            && let ImagePayload::Decoded(image) = &resolved.image.payload
        {
            self.shared
                .memory_cache
                .put(self.key.clone(), image.clone())
                .await;
        }
    }

    fn resolved(
        &self,
        payload: ImagePayload,
        origin: ImageOrigin,
        fetched: Option<Bytes>,
    ) -> Resolved {
        Resolved {
            image: LoadedImage {
                key: self.key.clone(),
                payload,
                origin,
            },
            fetched,
        }
    }

    /// Delivers an attempt error to the tasks currently waiting.
    fn report(&self, error: &LoadError) {
        let waiters = self
            .shared
            .in_flight
            .lock()
            .get(&self.key)
            .filter(|f| f.id == self.flight_id)
            .map(|f| f.waiters.clone())
            .unwrap_or_default();
        for task in waiters {
            task.notify_error(error);
        }
    }

    /// Removes this job's flight, unless it was cancelled or replaced.
    fn take_flight(&self) -> Option<InFlight> {
        let mut in_flight = self.shared.in_flight.lock();
        let owned = in_flight
            .get(&self.key)
            .is_some_and(|f| f.id == self.flight_id);
        if owned {
            in_flight.remove(&self.key)
        } else {
            None
        }
    }

    fn finish(self, flight: InFlight, outcome: Result<LoadedImage, LoadError>) {
        self.shared.completed.fetch_add(1, Ordering::Relaxed);

        match &outcome {
            Ok(image) => debug!(
                key = %self.key,
                origin = %image.origin,
                waiters = flight.waiters.len(),
                "Image loaded successfully"
            ),
            Err(e) => debug!(
                key = %self.key,
                error = %e,
                waiters = flight.waiters.len(),
                "Image load failed"
            ),
        }

        for task in &flight.waiters {
            task.complete(&outcome);
        }

        if flight.deferred.is_empty() {
            return;
        }
        let Some(tx) = self.resubmit_tx.upgrade() else {
            warn!(key = %self.key, "Service stopped, dropping deferred loads");
            return;
        };
        for task in flight.deferred {
            if let Err(e) = tx.send(Command::Load(task)) {
                error!("Failed to resubmit deferred load: {}", e);
            }
        }
    }
}

async fn decode(
    bytes: Bytes,
    transformations: Vec<Transformation>,
) -> Result<image::DynamicImage, LoadError> {
    tokio::task::spawn_blocking(move || {
        let mut image = image::load_from_memory(&bytes)
            .map_err(|e| LoadError::decode(format!("Failed to decode image: {e}")))?;
        for transformation in &transformations {
            image = transformation.apply(image);
        }
        Ok(image)
    })
    .await
    .map_err(|e| LoadError::decode(format!("Decode task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::LoadRequest;
    use crate::domain::ports::mocks::{MockImageFetcher, png_bytes};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Error(String),
        Success(ImageOrigin, bool),
        Finish,
    }

    fn config(max_concurrent_loads: usize) -> ImageServiceConfig {
        ImageServiceConfig {
            max_concurrent_loads,
            retry_count: 2,
            retry_delay_ms: 1,
            ..ImageServiceConfig::default()
        }
    }

    async fn service_with(
        fetcher: Arc<MockImageFetcher>,
        config: ImageServiceConfig,
    ) -> (ImageService, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let disk_cache = DiskImageCache::new(temp_dir.path().to_path_buf(), 1024 * 1024)
            .await
            .unwrap();
        let service = ImageService::new(config, Arc::new(disk_cache), fetcher);
        (service, temp_dir)
    }

    fn observed(request: LoadRequest) -> (ScheduledTask, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (e, s, f) = (tx.clone(), tx.clone(), tx);
        let request = request
            .on_error(move |err| {
                let _ = e.send(Event::Error(err.to_string()));
            })
            .on_success(move |img| {
                let _ = s.send(Event::Success(img.origin, img.is_encoded()));
            })
            .on_finish(move |_| {
                let _ = f.send(Event::Finish);
            });
        let task = ScheduledTask::new(
            CacheKey::for_request(&request),
            request.clone(),
            request.priority().unwrap_or_default(),
            request.cache().unwrap_or_default(),
            None,
        );
        (task, rx)
    }

    async fn until_finish(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for load")
                .expect("task dropped without finishing");
            let done = event == Event::Finish;
            events.push(event);
            if done {
                return events;
            }
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_second_load_served_from_memory() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let (service, _temp) = service_with(fetcher.clone(), config(4)).await;
        let request = LoadRequest::file("/images/a.png");

        let (task, mut rx) = observed(request.clone());
        service.load_image(task);
        assert_eq!(
            until_finish(&mut rx).await,
            vec![Event::Success(ImageOrigin::Local, false), Event::Finish]
        );

        let (task, mut rx) = observed(request);
        service.load_image(task);
        assert_eq!(
            until_finish(&mut rx).await,
            vec![Event::Success(ImageOrigin::MemoryCache, false), Event::Finish]
        );
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_disk_serves_after_memory_invalidation() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let (service, _temp) = service_with(fetcher.clone(), config(4)).await;
        let request = LoadRequest::url("https://example.com/a.png");
        let key = CacheKey::for_request(&request);

        let (task, mut rx) = observed(request.clone());
        service.load_image(task);
        until_finish(&mut rx).await;
        assert!(service.is_cached(&key, CacheTier::All).await);

        service
            .invalidate_cache_entry(&key, CacheTier::Memory)
            .await
            .unwrap();
        let (task, mut rx) = observed(request.clone());
        service.load_image(task);
        assert_eq!(
            until_finish(&mut rx).await,
            vec![Event::Success(ImageOrigin::DiskCache, false), Event::Finish]
        );
        assert_eq!(fetcher.calls(), 1);

        service
            .invalidate_cache_entry(&key, CacheTier::All)
            .await
            .unwrap();
        let (task, mut rx) = observed(request);
        service.load_image(task);
        assert_eq!(
            until_finish(&mut rx).await,
            vec![Event::Success(ImageOrigin::Network, false), Event::Finish]
        );
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_unknown_key_is_ok() {
        let (service, _temp) = service_with(Arc::new(MockImageFetcher::new()), config(1)).await;
        let result = service
            .invalidate_cache_entry(&CacheKey::new("never-cached"), CacheTier::All)
            .await;
        tokio_test::assert_ok!(result);
    }

    #[tokio::test]
    async fn test_concurrent_loads_fetch_once() {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Arc::new(MockImageFetcher::gated(gate.clone()));
        let (service, _temp) = service_with(fetcher.clone(), config(4)).await;
        let request = LoadRequest::url("https://example.com/shared.png");
        let key = CacheKey::for_request(&request);

        let (first, mut first_rx) = observed(request.clone());
        let (second, mut second_rx) = observed(request);
        service.load_image(first);
        service.load_image(second);

        wait_until(|| fetcher.calls() == 1 && service.waiter_count(&key) == 2).await;
        gate.add_permits(1);

        let success = vec![Event::Success(ImageOrigin::Network, false), Event::Finish];
        assert_eq!(until_finish(&mut first_rx).await, success);
        assert_eq!(until_finish(&mut second_rx).await, success);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_priority_order_with_submission_tiebreak() {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Arc::new(MockImageFetcher::gated(gate.clone()));
        let (service, _temp) = service_with(fetcher.clone(), config(1)).await;

        let (blocker, mut blocker_rx) = observed(LoadRequest::file("blocker.png"));
        service.load_image(blocker);
        wait_until(|| fetcher.calls() == 1).await;

        let mut receivers = Vec::new();
        for (name, priority) in [
            ("low.png", Priority::Low),
            ("normal-1.png", Priority::Normal),
            ("high.png", Priority::High),
            ("normal-2.png", Priority::Normal),
        ] {
            let (task, rx) = observed(LoadRequest::file(name).with_priority(priority));
            service.load_image(task);
            receivers.push(rx);
        }
        wait_until(|| service.pending_count() == 5).await;
        gate.add_permits(10);

        until_finish(&mut blocker_rx).await;
        for rx in &mut receivers {
            until_finish(rx).await;
        }

        assert_eq!(
            fetcher.order(),
            vec![
                "file:blocker.png",
                "file:high.png",
                "file:normal-1.png",
                "file:normal-2.png",
                "file:low.png",
            ]
        );
    }

    #[tokio::test]
    async fn test_priority_bump_on_join() {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Arc::new(MockImageFetcher::gated(gate.clone()));
        let (service, _temp) = service_with(fetcher.clone(), config(1)).await;

        let (blocker, mut blocker_rx) = observed(LoadRequest::file("blocker.png"));
        service.load_image(blocker);
        wait_until(|| fetcher.calls() == 1).await;

        let (normal, mut normal_rx) = observed(LoadRequest::file("normal.png"));
        let (low, mut low_rx) =
            observed(LoadRequest::file("later.png").with_priority(Priority::Low));
        let (bump, mut bump_rx) =
            observed(LoadRequest::file("later.png").with_priority(Priority::Highest));
        service.load_image(normal);
        service.load_image(low);
        service.load_image(bump);
        let later = CacheKey::for_request(&LoadRequest::file("later.png"));
        wait_until(|| service.waiter_count(&later) == 2).await;
        gate.add_permits(10);

        for rx in [&mut blocker_rx, &mut normal_rx, &mut low_rx, &mut bump_rx] {
            until_finish(rx).await;
        }
        assert_eq!(
            fetcher.order(),
            vec!["file:blocker.png", "file:later.png", "file:normal.png"]
        );
    }

    #[tokio::test]
    async fn test_bumped_key_requeued_keeps_submission_order() {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Arc::new(MockImageFetcher::gated(gate.clone()));
        let (service, _temp) = service_with(fetcher.clone(), config(1)).await;
        let k = || LoadRequest::file("k.png").with_cache(CachePolicy::None);
        let k_key = CacheKey::for_request(&k());

        let (blocker, mut blocker_rx) = observed(LoadRequest::file("blocker.png"));
        service.load_image(blocker);
        wait_until(|| fetcher.calls() == 1).await;

        let (k_normal, mut k_normal_rx) = observed(k());
        let (k_high, mut k_high_rx) = observed(k().with_priority(Priority::High));
        let (x, mut x_rx) = observed(LoadRequest::file("x.png").with_priority(Priority::High));
        let (j, mut j_rx) = observed(LoadRequest::file("j.png"));
        service.load_image(k_normal);
        service.load_image(k_high);
        service.load_image(x);
        service.load_image(j);
        wait_until(|| service.pending_count() == 4 && service.waiter_count(&k_key) == 2).await;

        // Blocker and k complete, x starts and holds the only slot.
        gate.add_permits(2);
        until_finish(&mut blocker_rx).await;
        until_finish(&mut k_normal_rx).await;
        until_finish(&mut k_high_rx).await;
        wait_until(|| fetcher.calls() == 3).await;

        let (k_again, mut k_again_rx) = observed(k());
        service.load_image(k_again);
        wait_until(|| service.pending_count() == 3 && service.waiter_count(&k_key) == 1).await;
        gate.add_permits(10);

        for rx in [&mut x_rx, &mut j_rx, &mut k_again_rx] {
            until_finish(rx).await;
        }
        assert_eq!(
            fetcher.order(),
            vec![
                "file:blocker.png",
                "file:k.png",
                "file:x.png",
                "file:j.png",
                "file:k.png",
            ]
        );
    }

    #[tokio::test]
    async fn test_joiner_widens_cache_policy_of_running_load() {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Arc::new(MockImageFetcher::gated(gate.clone()));
        let (service, _temp) = service_with(fetcher.clone(), config(4)).await;
        let request = LoadRequest::url("https://example.com/shared.png");
        let key = CacheKey::for_request(&request);

        let (uncached, mut uncached_rx) = observed(request.clone().with_cache(CachePolicy::None));
        service.load_image(uncached);
        wait_until(|| fetcher.calls() == 1).await;

        let (cached, mut cached_rx) = observed(request.clone());
        service.load_image(cached);
        wait_until(|| service.waiter_count(&key) == 2).await;
        gate.add_permits(1);

        let success = vec![Event::Success(ImageOrigin::Network, false), Event::Finish];
        assert_eq!(until_finish(&mut uncached_rx).await, success);
        assert_eq!(until_finish(&mut cached_rx).await, success);
        assert!(service.is_cached(&key, CacheTier::Memory).await);
        assert!(service.is_cached(&key, CacheTier::Disk).await);

        let (again, mut again_rx) = observed(request);
        service.load_image(again);
        assert_eq!(
            until_finish(&mut again_rx).await,
            vec![Event::Success(ImageOrigin::MemoryCache, false), Event::Finish]
        );
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_running_load_is_silent() {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Arc::new(MockImageFetcher::gated(gate.clone()));
        let (service, _temp) = service_with(fetcher.clone(), config(1)).await;

        let (task, mut rx) = observed(LoadRequest::file("a.png"));
        let handle = task.handle().clone();
        service.load_image(task);
        wait_until(|| fetcher.calls() == 1).await;

        service.cancel(&handle);
        wait_until(|| service.pending_count() == 0).await;
        gate.add_permits(1);

        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(next, None);
        assert!(handle.is_cancelled());
        assert!(!handle.is_finished());
    }

    #[tokio::test]
    async fn test_cancelled_queued_load_is_never_fetched() {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Arc::new(MockImageFetcher::gated(gate.clone()));
        let (service, _temp) = service_with(fetcher.clone(), config(1)).await;

        let (blocker, mut blocker_rx) = observed(LoadRequest::file("blocker.png"));
        service.load_image(blocker);
        wait_until(|| fetcher.calls() == 1).await;

        let (queued, _queued_rx) = observed(LoadRequest::file("queued.png"));
        let handle = queued.handle().clone();
        service.load_image(queued);
        wait_until(|| service.pending_count() == 2).await;
        handle.cancel();
        wait_until(|| service.pending_count() == 1).await;

        gate.add_permits(10);
        until_finish(&mut blocker_rx).await;
        wait_until(|| service.pending_count() == 0).await;
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_retry_reports_each_attempt() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let request = LoadRequest::url("https://example.com/flaky.png");
        fetcher.script(
            request.source(),
            Err(LoadError::network("https://example.com/flaky.png", "reset")),
        );
        let (service, _temp) = service_with(fetcher.clone(), config(1)).await;

        let (task, mut rx) = observed(request);
        service.load_image(task);

        assert_eq!(
            until_finish(&mut rx).await,
            vec![
                Event::Error("network error fetching https://example.com/flaky.png: reset".into()),
                Event::Success(ImageOrigin::Network, false),
                Event::Finish,
            ]
        );
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_fast() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let request = LoadRequest::url("https://example.com/missing.png");
        fetcher.script(
            request.source(),
            Err(LoadError::http_status("https://example.com/missing.png", 404)),
        );
        let (service, _temp) = service_with(fetcher.clone(), config(1)).await;

        let (task, mut rx) = observed(request);
        service.load_image(task);

        assert_eq!(
            until_finish(&mut rx).await,
            vec![
                Event::Error("http 404 fetching https://example.com/missing.png".into()),
                Event::Finish,
            ]
        );
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_every_attempt() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let request = LoadRequest::url("https://example.com/down.png");
        for _ in 0..3 {
            fetcher.script(
                request.source(),
                Err(LoadError::http_status("https://example.com/down.png", 503)),
            );
        }
        let (service, _temp) = service_with(fetcher.clone(), config(1)).await;

        let (task, mut rx) = observed(request);
        service.load_image(task);

        let events = until_finish(&mut rx).await;
        let errors = events
            .iter()
            .filter(|e| matches!(e, Event::Error(_)))
            .count();
        assert_eq!(errors, 3);
        assert_eq!(events.last(), Some(&Event::Finish));
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_decode_failure_is_reported() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let request = LoadRequest::file("corrupt.png");
        fetcher.script(request.source(), Ok(Bytes::from_static(b"not an image")));
        let (service, _temp) = service_with(fetcher.clone(), config(1)).await;
        let key = CacheKey::for_request(&request);

        let (task, mut rx) = observed(request);
        service.load_image(task);

        let events = until_finish(&mut rx).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::Error(msg) if msg.starts_with("decode error")));
        assert!(!service.is_cached(&key, CacheTier::Disk).await);
    }

    #[tokio::test]
    async fn test_transformations_applied_before_caching() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let request = LoadRequest::file("big.png").with_downsample(8, 8);
        fetcher.script(request.source(), Ok(png_bytes(32, 16)));
        let (service, _temp) = service_with(fetcher, config(1)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = request.on_success(move |img| {
            let _ = tx.send(img.dimensions());
        });
        let (task, mut events) = observed(request);
        service.load_image(task);
        until_finish(&mut events).await;

        assert_eq!(rx.recv().await, Some(Some((8, 4))));
    }

    #[tokio::test]
    async fn test_download_only_skips_decode_and_memory() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let (service, _temp) = service_with(fetcher, config(1)).await;
        let request = LoadRequest::url("https://example.com/a.png")
            .with_cache(CachePolicy::Disk)
            .into_preload();
        let key = CacheKey::for_request(&request);

        let (task, mut rx) = observed(request);
        service.load_image(task);

        assert_eq!(
            until_finish(&mut rx).await,
            vec![Event::Success(ImageOrigin::Network, true), Event::Finish]
        );
        assert!(service.is_cached(&key, CacheTier::Disk).await);
        assert!(!service.is_cached(&key, CacheTier::Memory).await);
    }

    #[tokio::test]
    async fn test_display_request_deferred_behind_download() {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Arc::new(MockImageFetcher::gated(gate.clone()));
        let (service, _temp) = service_with(fetcher.clone(), config(2)).await;
        let request = LoadRequest::url("https://example.com/a.png");
        let key = CacheKey::for_request(&request);

        let (download, mut download_rx) =
            observed(request.clone().with_cache(CachePolicy::Disk).into_preload());
        service.load_image(download);
        wait_until(|| fetcher.calls() == 1).await;

        let (display, mut display_rx) = observed(request);
        service.load_image(display);
        wait_until(|| service.waiter_count(&key) == 2).await;
        gate.add_permits(1);

        assert_eq!(
            until_finish(&mut download_rx).await,
            vec![Event::Success(ImageOrigin::Network, true), Event::Finish]
        );
        assert_eq!(
            until_finish(&mut display_rx).await,
            vec![Event::Success(ImageOrigin::DiskCache, false), Event::Finish]
        );
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_silences_everything() {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Arc::new(MockImageFetcher::gated(gate.clone()));
        let (service, _temp) = service_with(fetcher.clone(), config(1)).await;

        let (running, mut running_rx) = observed(LoadRequest::file("a.png"));
        let (queued, mut queued_rx) = observed(LoadRequest::file("b.png"));
        service.load_image(running);
        service.load_image(queued);
        wait_until(|| fetcher.calls() == 1 && service.pending_count() == 2).await;

        service.cancel_all();
        wait_until(|| service.pending_count() == 0).await;
        gate.add_permits(10);

        assert_eq!(running_rx.recv().await, None);
        assert_eq!(queued_rx.recv().await, None);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let (service, _temp) = service_with(fetcher, config(2)).await;

        let (task, mut rx) = observed(LoadRequest::url("https://example.com/a.png"));
        service.load_image(task);
        until_finish(&mut rx).await;

        let stats = service.stats();
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.disk_entries, 1);
        assert_eq!(stats.memory.size, 1);

        service.clear(CacheTier::All).await.unwrap();
        let stats = service.stats();
        assert_eq!(stats.disk_entries, 0);
        assert_eq!(stats.memory.size, 0);
    }
}
