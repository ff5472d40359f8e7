//! Sync coordination: remote query, mapping, reconciliation into the local
//! store, search indexing and scheduling.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chnl_adapters::{
    carry_over_fallbacks, map_record, plain_text, resolve_job_logo, HttpLogoFetcher, HttpRecordStore, LogoFetcher,
    MappingContext, MemoryRecordStore, NoLogoFetcher, RecordQuery, RecordStore, RemoteError,
    RemoteRecord,
};
use chnl_core::{Entity, EntityKind, Job, Meetup};
use chnl_storage::{HttpClientConfig, HttpFetcher, LocalStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chnl-sync";

/// Creator attribute stamped on every search item.
pub const SEARCH_CREATOR: &str = "CocoaHeadsNL";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// HTTP record store base URL; fixtures are used when unset.
    pub remote_url: Option<String>,
    pub fixtures_dir: PathBuf,
    pub store_path: PathBuf,
    pub index_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub remote_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            fixtures_dir: PathBuf::from("./fixtures/records"),
            store_path: PathBuf::from("./data/store.json"),
            index_path: PathBuf::from("./data/search_index.json"),
            user_agent: "chnl-bot/0.1".to_string(),
            http_timeout_secs: 20,
            remote_timeout_secs: 30,
            scheduler_enabled: false,
            sync_cron: "0 */30 * * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            remote_url: std::env::var("CHNL_REMOTE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            fixtures_dir: std::env::var("CHNL_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.fixtures_dir),
            store_path: std::env::var("CHNL_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            index_path: std::env::var("CHNL_INDEX_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.index_path),
            user_agent: std::env::var("CHNL_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("CHNL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            remote_timeout_secs: std::env::var("CHNL_REMOTE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.remote_timeout_secs),
            scheduler_enabled: std::env::var("CHNL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("CHNL_SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote record store unavailable while syncing {kind}: {source}")]
    RemoteUnavailable {
        kind: EntityKind,
        #[source]
        source: RemoteError,
    },
    #[error("saving {kind} records locally failed: {source}")]
    LocalWriteFailed {
        kind: EntityKind,
        #[source]
        source: StoreError,
    },
    #[error("a {0} sync is already in progress")]
    SyncInProgress(EntityKind),
}

impl SyncError {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::RemoteUnavailable { kind, .. } | Self::LocalWriteFailed { kind, .. } => *kind,
            Self::SyncInProgress(kind) => *kind,
        }
    }

    /// Whether the failure should be surfaced to the user with a retry option.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::RemoteUnavailable { .. } | Self::LocalWriteFailed { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub pass_id: Uuid,
    pub kind: EntityKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: usize,
    /// Records mapped and reconciled into the store.
    pub synced: usize,
    pub malformed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub revision: u64,
    pub indexed: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchAttributes {
    pub title: String,
    pub content_description: String,
    pub creator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Vec<u8>>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchableItem {
    /// `"<type>:<identifier>"`, the same form deep links use.
    pub unique_identifier: String,
    pub domain_identifier: String,
    pub attributes: SearchAttributes,
}

impl SearchableItem {
    pub fn for_job(job: &Job) -> Self {
        Self {
            unique_identifier: format!("{}:{}", EntityKind::Job.domain(), job.record_name),
            domain_identifier: EntityKind::Job.domain().to_string(),
            attributes: SearchAttributes {
                title: job.title.clone(),
                content_description: plain_text(&job.content),
                creator: SEARCH_CREATOR.to_string(),
                thumbnail: job.logo.clone(),
                keywords: Vec::new(),
            },
        }
    }

    pub fn for_meetup(meetup: &Meetup) -> Self {
        let keywords = [
            SEARCH_CREATOR,
            meetup.location_name.as_str(),
            meetup.location.as_str(),
        ]
        .into_iter()
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect();
        Self {
            unique_identifier: format!("{}:{}", EntityKind::Meetup.domain(), meetup.record_name),
            domain_identifier: EntityKind::Meetup.domain().to_string(),
            attributes: SearchAttributes {
                title: meetup.name.clone(),
                content_description: plain_text(&meetup.description),
                creator: SEARCH_CREATOR.to_string(),
                thumbnail: meetup.small_logo.clone(),
                keywords,
            },
        }
    }

    /// Index key for `id` of `kind`, or `None` for kinds that are not
    /// searchable.
    pub fn unique_identifier_for(kind: EntityKind, id: &str) -> Option<String> {
        matches!(kind, EntityKind::Job | EntityKind::Meetup)
            .then(|| format!("{}:{id}", kind.domain()))
    }

    /// Only jobs and meetups are searchable.
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        match entity {
            Entity::Job(job) => Some(Self::for_job(job)),
            Entity::Meetup(meetup) => Some(Self::for_meetup(meetup)),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("search index io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("search index encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Add or replace items by unique identifier.
    async fn index_items(&self, items: Vec<SearchableItem>) -> Result<(), IndexError>;

    /// Drop items by unique identifier; unknown identifiers are ignored.
    async fn remove_items(&self, unique_identifiers: Vec<String>) -> Result<(), IndexError>;
}

#[derive(Debug, Default)]
pub struct MemorySearchIndex {
    items: tokio::sync::Mutex<BTreeMap<String, SearchableItem>>,
}

impl MemorySearchIndex {
    pub async fn items(&self) -> Vec<SearchableItem> {
        self.items.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, unique_identifier: &str) -> Option<SearchableItem> {
        self.items.lock().await.get(unique_identifier).cloned()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn index_items(&self, items: Vec<SearchableItem>) -> Result<(), IndexError> {
        let mut guard = self.items.lock().await;
        for item in items {
            guard.insert(item.unique_identifier.clone(), item);
        }
        Ok(())
    }

    async fn remove_items(&self, unique_identifiers: Vec<String>) -> Result<(), IndexError> {
        let mut guard = self.items.lock().await;
        for key in &unique_identifiers {
            guard.remove(key);
        }
        Ok(())
    }
}

/// Search index persisted as one JSON object keyed by unique identifier.
#[derive(Debug)]
pub struct JsonFileSearchIndex {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileSearchIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<BTreeMap<String, SearchableItem>, IndexError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(IndexError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl JsonFileSearchIndex {
    async fn write_all(&self, items: &BTreeMap<String, SearchableItem>) -> Result<(), IndexError> {
        let io_err = |source| IndexError::Io {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(items)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &bytes).await.map_err(io_err)?;
        fs::rename(&temp_path, &self.path).await.map_err(io_err)
    }
}

#[async_trait]
impl SearchIndex for JsonFileSearchIndex {
    async fn index_items(&self, items: Vec<SearchableItem>) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        let mut existing = self.load().await?;
        for item in items {
            existing.insert(item.unique_identifier.clone(), item);
        }
        self.write_all(&existing).await
    }

    async fn remove_items(&self, unique_identifiers: Vec<String>) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        let mut existing = self.load().await?;
        let before = existing.len();
        for key in &unique_identifiers {
            existing.remove(key);
        }
        if existing.len() == before {
            return Ok(());
        }
        self.write_all(&existing).await
    }
}

/// Kinds with a pass in flight, each with a flag asking the running pass to
/// go again once it finishes.
type InFlightSet = Arc<Mutex<HashMap<EntityKind, bool>>>;

/// Marks one kind as syncing; released on drop, including when the pass
/// future is cancelled.
#[derive(Debug)]
struct InFlightToken {
    registry: InFlightSet,
    kind: EntityKind,
    held: bool,
}

impl InFlightToken {
    fn acquire(registry: &InFlightSet, kind: EntityKind) -> Option<Self> {
        let mut kinds = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if kinds.contains_key(&kind) {
            return None;
        }
        kinds.insert(kind, false);
        Some(Self {
            registry: Arc::clone(registry),
            kind,
            held: true,
        })
    }

    /// Ask the holder of `kind` for another pass. `false` when nothing is in
    /// flight.
    fn request_rerun(registry: &InFlightSet, kind: EntityKind) -> bool {
        let mut kinds = registry.lock().unwrap_or_else(PoisonError::into_inner);
        match kinds.get_mut(&kind) {
            Some(requested) => {
                *requested = true;
                true
            }
            None => false,
        }
    }

    /// Consume a pending rerun request, or release the kind when there is
    /// none. Both happen under one lock so no request falls in between.
    fn rerun_or_release(&mut self) -> bool {
        let mut kinds = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        match kinds.get_mut(&self.kind) {
            Some(requested) if *requested => {
                *requested = false;
                true
            }
            _ => {
                kinds.remove(&self.kind);
                self.held = false;
                false
            }
        }
    }
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        if self.held {
            self.registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.kind);
        }
    }
}

/// Runs sync passes for each entity kind against one remote store and one
/// local store.
pub struct SyncCoordinator {
    remote: Arc<dyn RecordStore>,
    store: Arc<LocalStore>,
    logos: Arc<dyn LogoFetcher>,
    index: Arc<dyn SearchIndex>,
    remote_timeout: Duration,
    in_flight: InFlightSet,
}

impl SyncCoordinator {
    pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(remote: Arc<dyn RecordStore>, store: Arc<LocalStore>) -> Self {
        Self {
            remote,
            store,
            logos: Arc::new(NoLogoFetcher),
            index: Arc::new(MemorySearchIndex::default()),
            remote_timeout: Self::DEFAULT_REMOTE_TIMEOUT,
            in_flight: Arc::default(),
        }
    }

    pub fn with_logo_fetcher(mut self, logos: Arc<dyn LogoFetcher>) -> Self {
        self.logos = logos;
        self
    }

    pub fn with_search_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.index = index;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn is_syncing(&self, kind: EntityKind) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    /// One full pass for `kind`: afterwards the local identifier set equals
    /// the remote one. A second call for a kind already in flight is rejected.
    ///
    /// When [`watch`](Self::watch) sees a new record while the pass runs, the
    /// pass is repeated before returning; the last pass's result is returned.
    pub async fn sync(&self, kind: EntityKind) -> Result<SyncSummary, SyncError> {
        let mut token = InFlightToken::acquire(&self.in_flight, kind)
            .ok_or(SyncError::SyncInProgress(kind))?;
        loop {
            let pass_id = Uuid::new_v4();
            let outcome = self
                .run_pass(kind, pass_id)
                .instrument(info_span!("sync_pass", %pass_id, %kind))
                .await;
            if !token.rerun_or_release() {
                return outcome;
            }
            if let Err(err) = &outcome {
                warn!(%kind, error = %err, "sync pass failed before rerun");
            }
            debug!(%kind, "records created during the pass, running again");
        }
    }

    /// One pass per kind, run concurrently.
    pub async fn sync_all(&self) -> Vec<(EntityKind, Result<SyncSummary, SyncError>)> {
        let (company, contributor, job, meetup, affiliate_link) = tokio::join!(
            self.sync(EntityKind::Company),
            self.sync(EntityKind::Contributor),
            self.sync(EntityKind::Job),
            self.sync(EntityKind::Meetup),
            self.sync(EntityKind::AffiliateLink),
        );
        vec![
            (EntityKind::Company, company),
            (EntityKind::Contributor, contributor),
            (EntityKind::Job, job),
            (EntityKind::Meetup, meetup),
            (EntityKind::AffiliateLink, affiliate_link),
        ]
    }

    /// Run a pass for every record-creation notice of `kind` until the
    /// subscription ends.
    pub async fn watch(&self, kind: EntityKind) -> Result<(), SyncError> {
        let mut subscription = self
            .remote
            .subscribe(kind)
            .await
            .map_err(|source| SyncError::RemoteUnavailable { kind, source })?;
        info!(%kind, "watching for new records");

        while let Some(notice) = subscription.next().await {
            debug!(%kind, record = %notice.record_name, "record created remotely");
            loop {
                match self.sync(kind).await {
                    Ok(summary) => {
                        debug!(%kind, synced = summary.synced, "watch pass complete");
                    }
                    Err(SyncError::SyncInProgress(_)) => {
                        if !InFlightToken::request_rerun(&self.in_flight, kind) {
                            // The running pass finished in between; start our own.
                            continue;
                        }
                        debug!(%kind, "pass already running, rerun requested");
                    }
                    Err(err) => warn!(%kind, error = %err, "watch pass failed"),
                }
                break;
            }
        }
        Ok(())
    }

    async fn fetch_all(
        &self,
        kind: EntityKind,
        pass_id: Uuid,
    ) -> Result<(Vec<RemoteRecord>, usize), SyncError> {
        let query = RecordQuery::for_kind(kind).with_pass_id(pass_id);
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = tokio::time::timeout(
                self.remote_timeout,
                self.remote.query(&query, cursor.as_deref()),
            )
            .await
            .unwrap_or(Err(RemoteError::Timeout(self.remote_timeout)))
            .map_err(|source| SyncError::RemoteUnavailable { kind, source })?;

            pages += 1;
            records.extend(page.records);
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok((records, pages))
    }

    async fn run_pass(&self, kind: EntityKind, pass_id: Uuid) -> Result<SyncSummary, SyncError> {
        let started_at = Utc::now();
        let (records, pages) = self.fetch_all(kind, pass_id).await?;

        let ctx = MappingContext::new(started_at);
        let stored = self.store.snapshot();
        let mut entities = Vec::with_capacity(records.len());
        let mut malformed = 0usize;
        for record in &records {
            match map_record(kind, record, &ctx) {
                Ok(mut entity) => {
                    let previous = stored.get(kind, &record.record_name);
                    carry_over_fallbacks(record, &mut entity, previous);
                    entities.push(entity);
                }
                Err(err) => {
                    malformed += 1;
                    warn!(record = %record.record_name, error = %err, "skipping malformed record");
                }
            }
        }

        for entity in &mut entities {
            if let Entity::Job(job) = entity {
                resolve_job_logo(job, self.logos.as_ref(), pass_id).await;
            }
        }

        let keep: HashSet<String> = entities.iter().map(|e| e.id().to_string()).collect();
        let synced = keep.len();
        let vanished = stored
            .ids(kind)
            .into_iter()
            .filter(|id| !keep.contains(id))
            .filter_map(|id| SearchableItem::unique_identifier_for(kind, &id))
            .collect::<Vec<_>>();

        // No await between here and the end of the commit.
        let mut tx = self.store.begin_write();
        tx.upsert(entities.iter().cloned());
        tx.delete_matching(kind, move |entity| !keep.contains(entity.id()));
        let report = tx
            .commit()
            .map_err(|source| SyncError::LocalWriteFailed { kind, source })?;

        let indexed = self.index_entities(&entities).await;
        self.unindex(vanished).await;

        let changes = report.changes_for(kind);
        let summary = SyncSummary {
            pass_id,
            kind,
            started_at,
            finished_at: Utc::now(),
            pages,
            synced,
            malformed,
            inserted: changes.map_or(0, |c| c.inserted.len()),
            updated: changes.map_or(0, |c| c.updated.len()),
            deleted: changes.map_or(0, |c| c.deleted.len()),
            revision: report.revision,
            indexed,
        };
        info!(
            synced,
            malformed,
            pages,
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            revision = summary.revision,
            "sync pass complete"
        );
        Ok(summary)
    }

    async fn unindex(&self, unique_identifiers: Vec<String>) {
        if unique_identifiers.is_empty() {
            return;
        }
        if let Err(err) = self.index.remove_items(unique_identifiers).await {
            warn!(error = %err, "search index cleanup failed");
        }
    }

    async fn index_entities(&self, entities: &[Entity]) -> usize {
        let items = entities
            .iter()
            .filter_map(SearchableItem::from_entity)
            .collect::<Vec<_>>();
        if items.is_empty() {
            return 0;
        }
        let count = items.len();
        match self.index.index_items(items).await {
            Ok(()) => count,
            Err(err) => {
                warn!(error = %err, "search indexing failed");
                0
            }
        }
    }
}

/// Wire a coordinator from configuration: file-backed local store, HTTP or
/// fixture remote store, HTTP logo fetcher and JSON search index.
pub fn coordinator_from_config(config: &SyncConfig) -> Result<SyncCoordinator> {
    let store = LocalStore::open(&config.store_path)
        .with_context(|| format!("opening local store {}", config.store_path.display()))?;
    let http = Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })
        .context("building http client")?,
    );

    let remote: Arc<dyn RecordStore> = match &config.remote_url {
        Some(url) => Arc::new(HttpRecordStore::new(Arc::clone(&http), url.clone())),
        None => Arc::new(
            MemoryRecordStore::from_fixture_dir(&config.fixtures_dir).with_context(|| {
                format!("loading record fixtures from {}", config.fixtures_dir.display())
            })?,
        ),
    };

    Ok(SyncCoordinator::new(remote, Arc::new(store))
        .with_logo_fetcher(Arc::new(HttpLogoFetcher::new(http)))
        .with_search_index(Arc::new(JsonFileSearchIndex::new(&config.index_path)))
        .with_remote_timeout(config.remote_timeout()))
}

pub async fn maybe_build_scheduler(
    coordinator: Arc<SyncCoordinator>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = CronJob::new_async(cron, move |_uuid, _l| {
        let coordinator = Arc::clone(&coordinator);
        Box::pin(async move {
            for (kind, outcome) in coordinator.sync_all().await {
                if let Err(err) = outcome {
                    warn!(%kind, error = %err, "scheduled sync failed");
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env(
    kind: Option<EntityKind>,
) -> Result<Vec<(EntityKind, Result<SyncSummary, SyncError>)>> {
    let config = SyncConfig::from_env();
    let coordinator = coordinator_from_config(&config)?;
    Ok(match kind {
        Some(kind) => vec![(kind, coordinator.sync(kind).await)],
        None => coordinator.sync_all().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chnl_adapters::FieldValue;
    use chrono::TimeZone;

    fn meetup_record(id: &str, days: i64) -> RemoteRecord {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 19, 0, 0).single().unwrap();
        RemoteRecord::new(EntityKind::Meetup, id)
            .with_field("name", FieldValue::String(format!("Meetup {id}")))
            .with_field("time", FieldValue::Timestamp(base + chrono::Duration::days(days)))
            .with_field("locationName", FieldValue::String("Amsterdam".into()))
            .with_field(
                "meetup_description",
                FieldValue::String("<p>Talks &amp; <b>drinks</b></p>".into()),
            )
    }

    #[test]
    fn only_transport_and_storage_failures_are_user_visible() {
        let remote = SyncError::RemoteUnavailable {
            kind: EntityKind::Job,
            source: RemoteError::Transport("reset".into()),
        };
        assert!(remote.is_user_visible());
        assert_eq!(remote.kind(), EntityKind::Job);
        assert!(!SyncError::SyncInProgress(EntityKind::Meetup).is_user_visible());
    }

    #[test]
    fn in_flight_token_is_exclusive_per_kind_and_released_on_drop() {
        let registry = InFlightSet::default();
        let token = InFlightToken::acquire(&registry, EntityKind::Job).unwrap();
        assert!(InFlightToken::acquire(&registry, EntityKind::Job).is_none());
        assert!(InFlightToken::acquire(&registry, EntityKind::Meetup).is_some());
        drop(token);
        assert!(InFlightToken::acquire(&registry, EntityKind::Job).is_some());
    }

    #[test]
    fn rerun_request_is_consumed_before_the_kind_is_released() {
        let registry = InFlightSet::default();
        assert!(!InFlightToken::request_rerun(&registry, EntityKind::Job));

        let mut token = InFlightToken::acquire(&registry, EntityKind::Job).unwrap();
        assert!(InFlightToken::request_rerun(&registry, EntityKind::Job));
        assert!(token.rerun_or_release());
        assert!(InFlightToken::acquire(&registry, EntityKind::Job).is_none());

        assert!(!token.rerun_or_release());
        assert!(InFlightToken::acquire(&registry, EntityKind::Job).is_some());
    }

    #[test]
    fn meetup_search_items_carry_keywords_and_plain_text() {
        let remote = meetup_record("m-1", 0);
        let ctx = MappingContext::new(Utc::now());
        let entity = map_record(EntityKind::Meetup, &remote, &ctx).unwrap();
        let item = SearchableItem::from_entity(&entity).unwrap();

        assert_eq!(item.unique_identifier, "meetup:m-1");
        assert_eq!(item.domain_identifier, "meetup");
        assert_eq!(item.attributes.creator, "CocoaHeadsNL");
        assert_eq!(item.attributes.content_description, "Talks & drinks");
        assert_eq!(item.attributes.keywords, vec!["CocoaHeadsNL", "Amsterdam"]);
    }

    #[tokio::test]
    async fn pass_indexes_meetups_but_not_contributors() {
        let remote = Arc::new(MemoryRecordStore::new());
        remote.replace_all(EntityKind::Meetup, vec![meetup_record("m-1", 0)]);
        remote.replace_all(
            EntityKind::Contributor,
            vec![RemoteRecord::new(EntityKind::Contributor, "c-1")],
        );
        let index = Arc::new(MemorySearchIndex::default());
        let coordinator = SyncCoordinator::new(remote, Arc::new(LocalStore::in_memory()))
            .with_search_index(index.clone());

        let meetups = coordinator.sync(EntityKind::Meetup).await.unwrap();
        let contributors = coordinator.sync(EntityKind::Contributor).await.unwrap();

        assert_eq!(meetups.indexed, 1);
        assert_eq!(contributors.indexed, 0);
        assert!(index.get("meetup:m-1").await.is_some());
        assert_eq!(index.items().await.len(), 1);
    }

    #[tokio::test]
    async fn reconciled_deletions_leave_the_search_index() {
        let remote = Arc::new(MemoryRecordStore::new());
        remote.replace_all(
            EntityKind::Meetup,
            vec![meetup_record("m-1", 0), meetup_record("m-2", 1)],
        );
        let index = Arc::new(MemorySearchIndex::default());
        let coordinator = SyncCoordinator::new(remote.clone(), Arc::new(LocalStore::in_memory()))
            .with_search_index(index.clone());
        coordinator.sync(EntityKind::Meetup).await.unwrap();
        assert_eq!(index.items().await.len(), 2);

        remote.replace_all(EntityKind::Meetup, vec![meetup_record("m-2", 1)]);
        let summary = coordinator.sync(EntityKind::Meetup).await.unwrap();

        assert_eq!(summary.deleted, 1);
        assert!(index.get("meetup:m-1").await.is_none());
        assert!(index.get("meetup:m-2").await.is_some());
    }

    #[tokio::test]
    async fn json_index_merges_items_across_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = JsonFileSearchIndex::new(dir.path().join("nested/index.json"));
        let ctx = MappingContext::new(Utc::now());
        let first = map_record(EntityKind::Meetup, &meetup_record("m-1", 0), &ctx).unwrap();
        let second = map_record(EntityKind::Meetup, &meetup_record("m-2", 1), &ctx).unwrap();

        index
            .index_items(vec![SearchableItem::from_entity(&first).unwrap()])
            .await
            .unwrap();
        index
            .index_items(vec![SearchableItem::from_entity(&second).unwrap()])
            .await
            .unwrap();

        let stored = index.load().await.unwrap();
        assert_eq!(
            stored.keys().cloned().collect::<Vec<_>>(),
            vec!["meetup:m-1", "meetup:m-2"]
        );

        index
            .remove_items(vec!["meetup:m-1".into(), "job:unknown".into()])
            .await
            .unwrap();
        let stored = index.load().await.unwrap();
        assert_eq!(stored.keys().cloned().collect::<Vec<_>>(), vec!["meetup:m-2"]);
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::new(MemoryRecordStore::new()),
            Arc::new(LocalStore::in_memory()),
        ));
        let sched = maybe_build_scheduler(coordinator, &SyncConfig::default())
            .await
            .unwrap();
        assert!(sched.is_none());
    }
}
