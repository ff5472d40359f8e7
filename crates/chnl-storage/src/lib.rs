//! Transactional local entity store + HTTP fetch utilities.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use chnl_core::{Entity, EntityKind};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chnl-storage";

const EVENT_CAPACITY: usize = 256;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading store snapshot {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing store snapshot {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding store snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("persisting store snapshot {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Orderings the store can apply to query results. Ties always fall back to
/// the record identifier so results are deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Identifier,
    /// Newest `sort_time` first; entities without a time sort last.
    MostRecentFirst,
    CommitCountDescending,
    Name,
}

impl SortKey {
    pub fn default_for(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Meetup | EntityKind::Job => Self::MostRecentFirst,
            EntityKind::Contributor => Self::CommitCountDescending,
            EntityKind::Company => Self::Name,
            EntityKind::AffiliateLink => Self::Identifier,
        }
    }

    fn compare(self, a: &Entity, b: &Entity) -> Ordering {
        let primary = match self {
            Self::Identifier => Ordering::Equal,
            Self::MostRecentFirst => b.sort_time().cmp(&a.sort_time()),
            Self::CommitCountDescending => {
                let count = |e: &Entity| e.as_contributor().map(|c| c.commit_count).unwrap_or(0);
                count(b).cmp(&count(a))
            }
            Self::Name => a.display_name().cmp(b.display_name()),
        };
        primary.then_with(|| a.id().cmp(b.id()))
    }
}

/// Immutable view of the store at one revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    revision: u64,
    entities: BTreeMap<EntityKind, BTreeMap<String, Entity>>,
}

impl Snapshot {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&Entity> {
        self.entities.get(&kind).and_then(|bucket| bucket.get(id))
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.entities.get(&kind).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self, kind: EntityKind) -> bool {
        self.len(kind) == 0
    }

    /// Identifiers of `kind`, in identifier order.
    pub fn ids(&self, kind: EntityKind) -> Vec<String> {
        self.entities
            .get(&kind)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn query<F>(&self, kind: EntityKind, predicate: F, sort: SortKey) -> Vec<Entity>
    where
        F: Fn(&Entity) -> bool,
    {
        let mut rows = self
            .entities
            .get(&kind)
            .map(|bucket| {
                bucket
                    .values()
                    .filter(|entity| predicate(entity))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| sort.compare(a, b));
        rows
    }

    /// All entities of `kind` in the kind's default list order.
    pub fn list(&self, kind: EntityKind) -> Vec<Entity> {
        self.query(kind, |_| true, SortKey::default_for(kind))
    }

    /// SHA-256 over the encoded entity content (revision excluded).
    pub fn content_digest(&self) -> Result<String, StoreError> {
        let bytes = serde_json::to_vec(&self.entities).map_err(StoreError::Encode)?;
        Ok(sha256_hex(&bytes))
    }
}

/// Index sets describing one committed change to a kind's default-ordered list.
/// `deleted` indexes the list before the commit; `inserted` and `updated`
/// index the list after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub kind: EntityKind,
    pub revision: u64,
    pub inserted: Vec<usize>,
    pub deleted: Vec<usize>,
    pub updated: Vec<usize>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && self.updated.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Initial {
        kind: EntityKind,
        revision: u64,
        len: usize,
    },
    Update(ChangeSet),
    Error {
        kind: EntityKind,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Store revision after the commit (unchanged for a no-op commit).
    pub revision: u64,
    pub changes: Vec<ChangeSet>,
}

impl CommitReport {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes_for(&self, kind: EntityKind) -> Option<&ChangeSet> {
        self.changes.iter().find(|c| c.kind == kind)
    }
}

enum WriteOp<'a> {
    Upsert(Entity),
    Delete {
        kind: EntityKind,
        id: String,
    },
    DeleteMatching {
        kind: EntityKind,
        predicate: Box<dyn Fn(&Entity) -> bool + Send + 'a>,
    },
}

/// Buffered write transaction. Nothing is visible until `commit`, and a
/// dropped transaction leaves the store untouched.
pub struct WriteTransaction<'a> {
    store: &'a LocalStore,
    ops: Vec<WriteOp<'a>>,
}

impl<'a> WriteTransaction<'a> {
    /// Insert or fully replace entities by identifier.
    pub fn upsert(&mut self, entities: impl IntoIterator<Item = Entity>) {
        self.ops.extend(entities.into_iter().map(WriteOp::Upsert));
    }

    pub fn delete(&mut self, kind: EntityKind, id: impl Into<String>) {
        self.ops.push(WriteOp::Delete {
            kind,
            id: id.into(),
        });
    }

    /// Delete every entity of `kind` matching `predicate`, evaluated against
    /// the store contents at commit time (after earlier operations).
    pub fn delete_matching<F>(&mut self, kind: EntityKind, predicate: F)
    where
        F: Fn(&Entity) -> bool + Send + 'a,
    {
        self.ops.push(WriteOp::DeleteMatching {
            kind,
            predicate: Box::new(predicate),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn rollback(self) {}

    /// Apply all operations atomically. On error the store keeps its previous
    /// contents and no event is emitted.
    pub fn commit(self) -> Result<CommitReport, StoreError> {
        let store = self.store;
        let _writer = store
            .commit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = store.snapshot();
        let mut next = (*current).clone();
        let mut touched = BTreeSet::new();

        for op in self.ops {
            match op {
                WriteOp::Upsert(entity) => {
                    let kind = entity.kind();
                    touched.insert(kind);
                    next.entities
                        .entry(kind)
                        .or_default()
                        .insert(entity.id().to_string(), entity);
                }
                WriteOp::Delete { kind, id } => {
                    touched.insert(kind);
                    if let Some(bucket) = next.entities.get_mut(&kind) {
                        bucket.remove(&id);
                    }
                }
                WriteOp::DeleteMatching { kind, predicate } => {
                    touched.insert(kind);
                    if let Some(bucket) = next.entities.get_mut(&kind) {
                        bucket.retain(|_, entity| !predicate(entity));
                    }
                }
            }
        }
        next.entities.retain(|_, bucket| !bucket.is_empty());

        let revision = current.revision + 1;
        let changes = touched
            .into_iter()
            .map(|kind| diff_kind(&current, &next, kind, revision))
            .filter(|change| !change.is_empty())
            .collect::<Vec<_>>();

        if changes.is_empty() {
            return Ok(CommitReport {
                revision: current.revision,
                changes,
            });
        }

        // Disk I/O happens before the swap; readers keep the old snapshot
        // until the file is in place.
        next.revision = revision;
        if let Some(path) = &store.persist_path {
            write_snapshot_atomically(path, &next)?;
        }

        let mut state = store
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *state = Arc::new(next);
        // Sent under the write lock so receivers observe commit order.
        for change in &changes {
            let _ = store.events.send(change.clone());
        }

        Ok(CommitReport { revision, changes })
    }
}

fn diff_kind(before: &Snapshot, after: &Snapshot, kind: EntityKind, revision: u64) -> ChangeSet {
    let old_rows = before.list(kind);
    let new_rows = after.list(kind);
    let old_by_id: HashMap<&str, &Entity> = old_rows.iter().map(|e| (e.id(), e)).collect();
    let new_ids: HashSet<&str> = new_rows.iter().map(Entity::id).collect();

    let deleted = old_rows
        .iter()
        .enumerate()
        .filter(|(_, e)| !new_ids.contains(e.id()))
        .map(|(i, _)| i)
        .collect();

    let mut inserted = Vec::new();
    let mut updated = Vec::new();
    for (i, entity) in new_rows.iter().enumerate() {
        match old_by_id.get(entity.id()) {
            None => inserted.push(i),
            Some(previous) if *previous != entity => updated.push(i),
            Some(_) => {}
        }
    }

    ChangeSet {
        kind,
        revision,
        inserted,
        deleted,
        updated,
    }
}

/// Write the encoded snapshot via a temp file + rename so a crash never leaves
/// a half-written store file behind.
fn write_snapshot_atomically(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let persist_err = |source| StoreError::Persist {
        path: path.to_path_buf(),
        source,
    };
    let bytes = serde_json::to_vec_pretty(snapshot).map_err(StoreError::Encode)?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(persist_err)?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&temp_path, path));

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(persist_err(err));
    }
    Ok(())
}

/// Local persisted cache of synced entities.
///
/// Readers take cheap `Arc<Snapshot>` handles and never block writers.
/// Commits are serialized by `commit_lock` and only take the state write
/// lock to swap in the new snapshot.
#[derive(Debug)]
pub struct LocalStore {
    state: RwLock<Arc<Snapshot>>,
    commit_lock: StdMutex<()>,
    persist_path: Option<PathBuf>,
    events: broadcast::Sender<ChangeSet>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self::with_snapshot(Snapshot::default(), None)
    }

    /// Open a file-backed store, loading the existing snapshot if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let snapshot = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(source) => return Err(StoreError::Load { path, source }),
        };
        Ok(Self::with_snapshot(snapshot, Some(path)))
    }

    fn with_snapshot(snapshot: Snapshot, persist_path: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(Arc::new(snapshot)),
            commit_lock: StdMutex::new(()),
            persist_path,
            events,
        }
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, Arc<Snapshot>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.read_state())
    }

    pub fn begin_write(&self) -> WriteTransaction<'_> {
        WriteTransaction {
            store: self,
            ops: Vec::new(),
        }
    }

    /// Change stream for one kind: an `Initial` event, then one `Update` per
    /// commit that changed the kind, in commit order.
    pub fn observe(&self, kind: EntityKind) -> StoreObserver {
        let rx = self.events.subscribe();
        let snapshot = self.snapshot();
        StoreObserver {
            kind,
            floor: snapshot.revision(),
            initial: Some(StoreEvent::Initial {
                kind,
                revision: snapshot.revision(),
                len: snapshot.len(kind),
            }),
            rx,
        }
    }
}

#[derive(Debug)]
pub struct StoreObserver {
    kind: EntityKind,
    floor: u64,
    initial: Option<StoreEvent>,
    rx: broadcast::Receiver<ChangeSet>,
}

impl StoreObserver {
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Next event for this kind, or `None` once the store is gone.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(change) if change.kind == self.kind && change.revision > self.floor => {
                    self.floor = change.revision;
                    return Some(StoreEvent::Update(change));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    return Some(StoreEvent::Error {
                        kind: self.kind,
                        message: format!("observer lagged, {skipped} change events dropped"),
                    });
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_scope_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_scope_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Shared HTTP client with a global and a per-scope concurrency limit.
/// Scopes are free-form (record type, "logo", ...).
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut map = self.per_scope.lock().await;
        map.entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        pass_id: Uuid,
        scope: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let scoped = self.scope_semaphore(scope).await;
        let _scope = scoped.acquire().await.map_err(|_| FetchError::LimiterClosed)?;

        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", %pass_id, scope, url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, status = status.as_u16(), "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
