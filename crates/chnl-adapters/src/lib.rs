//! Remote record store contracts, record mapping, and fixture/HTTP-backed stores.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chnl_core::{AffiliateLink, Company, Contributor, Entity, EntityKind, Job, Meetup};
use chnl_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Datelike, Utc};
use scraper::Html;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chnl-adapters";

const SUBSCRIPTION_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub path: PathBuf,
}

/// Typed value of one record field, encoded as `{"type": "...", "value": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldValue {
    String(String),
    Int64(i64),
    Double(f64),
    Timestamp(#[serde(with = "chrono::serde::ts_milliseconds")] DateTime<Utc>),
    Location(GeoLocation),
    Asset(AssetRef),
}

/// One record as handed over by the remote store.
///
/// Fields are kept undecoded; every accessor decodes on demand and answers
/// `None` when the field is missing, of another type, or unreadable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    #[serde(default)]
    pub record_name: String,
    #[serde(default)]
    pub record_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl RemoteRecord {
    pub fn new(kind: EntityKind, record_name: impl Into<String>) -> Self {
        Self {
            record_name: record_name.into(),
            record_type: kind.record_type().to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: FieldValue) -> Self {
        self.set_field(key, value);
        self
    }

    pub fn set_field(&mut self, key: &str, value: FieldValue) {
        let encoded = serde_json::to_value(value).unwrap_or_default();
        self.fields.insert(key.to_string(), encoded);
    }

    pub fn field(&self, key: &str) -> Option<FieldValue> {
        let raw = self.fields.get(key)?;
        FieldValue::deserialize(raw).ok()
    }

    pub fn string(&self, key: &str) -> Option<String> {
        match self.field(key)? {
            FieldValue::String(value) => Some(value),
            _ => None,
        }
    }

    /// Integer view of a numeric field; doubles are truncated.
    pub fn int64(&self, key: &str) -> Option<i64> {
        match self.field(key)? {
            FieldValue::Int64(value) => Some(value),
            FieldValue::Double(value) if value.is_finite() => Some(value.trunc() as i64),
            _ => None,
        }
    }

    pub fn int32(&self, key: &str) -> Option<i32> {
        self.int64(key).and_then(|value| i32::try_from(value).ok())
    }

    pub fn double(&self, key: &str) -> Option<f64> {
        match self.field(key)? {
            FieldValue::Double(value) => Some(value),
            FieldValue::Int64(value) => Some(value as f64),
            _ => None,
        }
    }

    /// Booleans travel as `INT64` 0/1.
    pub fn boolean(&self, key: &str) -> Option<bool> {
        match self.field(key)? {
            FieldValue::Int64(value) => Some(value != 0),
            _ => None,
        }
    }

    pub fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.field(key)? {
            FieldValue::Timestamp(value) => Some(value),
            _ => None,
        }
    }

    pub fn location(&self, key: &str) -> Option<GeoLocation> {
        match self.field(key)? {
            FieldValue::Location(value) => Some(value),
            _ => None,
        }
    }

    /// Bytes of a downloaded asset file.
    pub fn asset_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let FieldValue::Asset(asset) = self.field(key)? else {
            return None;
        };
        match fs::read(&asset.path) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                debug!(record = %self.record_name, key, path = %asset.path.display(), error = %err, "asset unreadable");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortDescriptor {
    pub field: String,
    pub ascending: bool,
}

/// Query for every record of one type. The predicate is always "all records".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub kind: EntityKind,
    pub sort: Option<SortDescriptor>,
    pub pass_id: Uuid,
}

impl RecordQuery {
    pub fn all(kind: EntityKind) -> Self {
        Self {
            kind,
            sort: None,
            pass_id: Uuid::nil(),
        }
    }

    /// The query a sync pass issues for `kind`: meetups newest first.
    pub fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Meetup => Self::all(kind).sorted_by("time", false),
            _ => Self::all(kind),
        }
    }

    pub fn sorted_by(mut self, field: &str, ascending: bool) -> Self {
        self.sort = Some(SortDescriptor {
            field: field.to_string(),
            ascending,
        });
        self
    }

    pub fn with_pass_id(mut self, pass_id: Uuid) -> Self {
        self.pass_id = pass_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordPage {
    pub records: Vec<RemoteRecord>,
    /// Continuation cursor; `None` when the result set is exhausted.
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordCreated {
    pub kind: EntityKind,
    pub record_name: String,
}

/// Stream of record-creation notices for one kind.
#[derive(Debug)]
pub struct Subscription {
    kind: EntityKind,
    rx: mpsc::Receiver<RecordCreated>,
}

impl Subscription {
    pub fn new(kind: EntityKind, rx: mpsc::Receiver<RecordCreated>) -> Self {
        Self { kind, rx }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub async fn next(&mut self) -> Option<RecordCreated> {
        self.rx.recv().await
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding record page from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("record store does not support subscriptions")]
    SubscriptionsUnsupported,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// One page of records matching `query`, starting at `cursor`.
    async fn query(
        &self,
        query: &RecordQuery,
        cursor: Option<&str>,
    ) -> Result<RecordPage, RemoteError>;

    /// Notices for records of `kind` created after the call.
    async fn subscribe(&self, kind: EntityKind) -> Result<Subscription, RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum FailureMode {
    /// Pages at or after this index fail with a transport error.
    FromPage(usize),
    Stall,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<EntityKind, Vec<RemoteRecord>>,
    subscribers: Vec<(EntityKind, mpsc::Sender<RecordCreated>)>,
    failure: Option<FailureMode>,
    queries: usize,
}

/// Record store held in memory, optionally seeded from a fixture directory.
#[derive(Debug)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
    page_size: usize,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub const DEFAULT_PAGE_SIZE: usize = 100;

    pub fn new() -> Self {
        Self::with_page_size(Self::DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            page_size: page_size.max(1),
        }
    }

    /// Load `<RecordType>.json` files (arrays of records) from `dir`.
    /// Relative asset paths are resolved against `dir`.
    pub fn from_fixture_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let store = Self::new();
        for kind in EntityKind::ALL {
            let path = dir.join(format!("{}.json", kind.record_type()));
            if !path.exists() {
                continue;
            }
            let mut records: Vec<RemoteRecord> = read_json_file(&path)?;
            for record in &mut records {
                rebase_asset_paths(record, dir);
            }
            store.replace_all(kind, records);
        }
        Ok(store)
    }

    pub fn paged(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the stored record set for `kind` without notifying subscribers.
    pub fn replace_all(&self, kind: EntityKind, records: Vec<RemoteRecord>) {
        self.lock().records.insert(kind, records);
    }

    /// Add a record under `kind` and notify subscribers of that kind.
    pub fn insert(&self, kind: EntityKind, record: RemoteRecord) {
        let mut state = self.lock();
        let notice = RecordCreated {
            kind,
            record_name: record.record_name.clone(),
        };
        state.records.entry(kind).or_default().push(record);
        state.subscribers.retain(|(subscribed, tx)| {
            if *subscribed != kind {
                return !tx.is_closed();
            }
            match tx.try_send(notice.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%kind, "subscriber lagging, creation notice dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn remove(&self, kind: EntityKind, record_name: &str) {
        if let Some(records) = self.lock().records.get_mut(&kind) {
            records.retain(|r| r.record_name != record_name);
        }
    }

    pub fn fail_from_page(&self, page_index: usize) {
        self.lock().failure = Some(FailureMode::FromPage(page_index));
    }

    /// Make every query hang until the caller gives up.
    pub fn stall(&self) {
        self.lock().failure = Some(FailureMode::Stall);
    }

    pub fn recover(&self) {
        self.lock().failure = None;
    }

    pub fn query_count(&self) -> usize {
        self.lock().queries
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn query(
        &self,
        query: &RecordQuery,
        cursor: Option<&str>,
    ) -> Result<RecordPage, RemoteError> {
        let offset = match cursor {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| RemoteError::Transport(format!("invalid cursor {raw:?}")))?,
            None => 0,
        };
        let page_index = offset / self.page_size;

        let outcome = {
            let mut state = self.lock();
            state.queries += 1;
            match state.failure {
                Some(FailureMode::Stall) => None,
                Some(FailureMode::FromPage(first_failing)) if page_index >= first_failing => {
                    return Err(RemoteError::Transport(format!(
                        "connection reset while reading page {page_index}"
                    )));
                }
                _ => {
                    let mut records = state.records.get(&query.kind).cloned().unwrap_or_default();
                    if let Some(sort) = &query.sort {
                        sort_records(&mut records, sort);
                    }
                    Some(records)
                }
            }
        };

        let Some(records) = outcome else {
            return std::future::pending().await;
        };

        let end = (offset + self.page_size).min(records.len());
        let page = records.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let cursor = (end < records.len()).then(|| end.to_string());
        Ok(RecordPage {
            records: page,
            cursor,
        })
    }

    async fn subscribe(&self, kind: EntityKind) -> Result<Subscription, RemoteError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.lock().subscribers.push((kind, tx));
        Ok(Subscription::new(kind, rx))
    }
}

#[derive(Debug, PartialEq, PartialOrd)]
enum SortValue {
    Number(f64),
    Time(DateTime<Utc>),
    Text(String),
}

fn sort_value(record: &RemoteRecord, field: &str) -> Option<SortValue> {
    match record.field(field)? {
        FieldValue::Int64(v) => Some(SortValue::Number(v as f64)),
        FieldValue::Double(v) => Some(SortValue::Number(v)),
        FieldValue::Timestamp(t) => Some(SortValue::Time(t)),
        FieldValue::String(s) => Some(SortValue::Text(s)),
        FieldValue::Location(_) | FieldValue::Asset(_) => None,
    }
}

/// Stable sort by one field; records without a sortable value go last.
fn sort_records(records: &mut [RemoteRecord], sort: &SortDescriptor) {
    records.sort_by_cached_key(|record| SortSlot(sort_value(record, &sort.field), sort.ascending));
}

struct SortSlot(Option<SortValue>, bool);

impl PartialEq for SortSlot {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortSlot {}

impl PartialOrd for SortSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.0, &other.0) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => {
                let ord = a.partial_cmp(b).unwrap_or(Ordering::Equal);
                if self.1 {
                    ord
                } else {
                    ord.reverse()
                }
            }
        }
    }
}

fn rebase_asset_paths(record: &mut RemoteRecord, base: &Path) {
    let keys = record.fields.keys().cloned().collect::<Vec<_>>();
    for key in keys {
        if let Some(FieldValue::Asset(asset)) = record.field(&key) {
            if asset.path.is_relative() {
                record.set_field(
                    &key,
                    FieldValue::Asset(AssetRef {
                        path: base.join(&asset.path),
                    }),
                );
            }
        }
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Record store reached over HTTP: `GET {base}/records/{RecordType}` returning
/// a JSON [`RecordPage`].
#[derive(Debug, Clone)]
pub struct HttpRecordStore {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
}

impl HttpRecordStore {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }

    pub fn page_url(&self, query: &RecordQuery, cursor: Option<&str>) -> Result<String, RemoteError> {
        let raw = format!(
            "{}/records/{}",
            self.base_url.trim_end_matches('/'),
            query.kind.record_type()
        );
        let mut url = reqwest::Url::parse(&raw)
            .map_err(|e| RemoteError::Transport(format!("invalid record store url {raw}: {e}")))?;

        let mut params = Vec::new();
        if let Some(sort) = &query.sort {
            params.push(("sortBy", sort.field.clone()));
            params.push(("ascending", sort.ascending.to_string()));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url.to_string())
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn query(
        &self,
        query: &RecordQuery,
        cursor: Option<&str>,
    ) -> Result<RecordPage, RemoteError> {
        let url = self.page_url(query, cursor)?;
        let response = self
            .fetcher
            .fetch_bytes(query.pass_id, query.kind.record_type(), &url)
            .await?;
        serde_json::from_slice(&response.body).map_err(|source| RemoteError::Decode { url, source })
    }

    async fn subscribe(&self, _kind: EntityKind) -> Result<Subscription, RemoteError> {
        Err(RemoteError::SubscriptionsUnsupported)
    }
}

/// Fetches logo images referenced by job records.
#[async_trait]
pub trait LogoFetcher: Send + Sync {
    /// Logo bytes, or `None` on any failure.
    async fn fetch_logo(&self, pass_id: Uuid, url: &str) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoLogoFetcher;

#[async_trait]
impl LogoFetcher for NoLogoFetcher {
    async fn fetch_logo(&self, _pass_id: Uuid, _url: &str) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct HttpLogoFetcher {
    fetcher: Arc<HttpFetcher>,
}

impl HttpLogoFetcher {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl LogoFetcher for HttpLogoFetcher {
    async fn fetch_logo(&self, pass_id: Uuid, url: &str) -> Option<Vec<u8>> {
        match self.fetcher.fetch_bytes(pass_id, "logo", url).await {
            Ok(response) if !response.body.is_empty() => Some(response.body),
            Ok(_) => None,
            Err(err) => {
                debug!(url, error = %err, "logo fetch failed");
                None
            }
        }
    }
}

/// Fill `job.logo` from `job.logo_url`; leaves it empty when the URL is
/// missing, unparsable, or the fetch fails.
pub async fn resolve_job_logo(job: &mut Job, fetcher: &dyn LogoFetcher, pass_id: Uuid) {
    job.logo = None;
    let Some(raw) = job.logo_url.as_deref() else {
        return;
    };
    if reqwest::Url::parse(raw).is_err() {
        debug!(record = %job.record_name, url = raw, "skipping unparsable logo url");
        return;
    }
    job.logo = fetcher.fetch_logo(pass_id, raw).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingContext {
    /// Start of the sync pass; stands in for missing dates.
    pub mapped_at: DateTime<Utc>,
}

impl MappingContext {
    pub fn new(mapped_at: DateTime<Utc>) -> Self {
        Self { mapped_at }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("record {record_name:?} has type {found:?}, expected {}", .expected.record_type())]
    WrongRecordType {
        record_name: String,
        expected: EntityKind,
        found: String,
    },
    #[error("{0} record is missing its identifier")]
    MissingIdentifier(EntityKind),
}

/// Map one remote record into a local entity of `kind`.
///
/// Field-level problems never fail: they fall back to the field's default.
/// Only a wrong record type or a missing identifier is an error.
pub fn map_record(
    kind: EntityKind,
    record: &RemoteRecord,
    ctx: &MappingContext,
) -> Result<Entity, MappingError> {
    if record.record_type != kind.record_type() {
        return Err(MappingError::WrongRecordType {
            record_name: record.record_name.clone(),
            expected: kind,
            found: record.record_type.clone(),
        });
    }
    if record.record_name.trim().is_empty() {
        return Err(MappingError::MissingIdentifier(kind));
    }

    Ok(match kind {
        EntityKind::Company => company_from_record(record).into(),
        EntityKind::Contributor => contributor_from_record(record).into(),
        EntityKind::Job => job_from_record(record, ctx).into(),
        EntityKind::Meetup => meetup_from_record(record, ctx).into(),
        EntityKind::AffiliateLink => affiliate_link_from_record(record).into(),
    })
}

pub fn company_from_record(record: &RemoteRecord) -> Company {
    let location = record.location("location");
    Company {
        record_name: record.record_name.clone(),
        name: record.string("name"),
        place: record.string("place"),
        street_address: record.string("streetAddress"),
        website: record.string("website"),
        zip_code: record.string("zipCode"),
        description: record.string("companyDescription"),
        email_address: record.string("emailAddress"),
        latitude: location.map(|l| l.latitude).unwrap_or(0.0),
        longitude: location.map(|l| l.longitude).unwrap_or(0.0),
        logo: record.asset_bytes("logo"),
        small_logo: record.asset_bytes("smallLogo"),
    }
}

pub fn contributor_from_record(record: &RemoteRecord) -> Contributor {
    Contributor {
        record_name: record.record_name.clone(),
        name: record.string("name").unwrap_or_default(),
        url: record.string("url").unwrap_or_default(),
        avatar_url: record.string("avatar_url").unwrap_or_default(),
        contributor_id: record.int64("contributor_id").unwrap_or(0),
        commit_count: record.int32("commit_count").unwrap_or(0),
    }
}

/// `logo` is left empty here; [`resolve_job_logo`] fills it.
pub fn job_from_record(record: &RemoteRecord, ctx: &MappingContext) -> Job {
    Job {
        record_name: record.record_name.clone(),
        title: record.string("title").unwrap_or_default(),
        content: record.string("content").unwrap_or_default(),
        date: record.timestamp("date").unwrap_or(ctx.mapped_at),
        link: record.string("link").unwrap_or_default(),
        logo_url: record.string("logoUrl"),
        logo: None,
        company_name: record.string("author").filter(|name| !name.is_empty()),
    }
}

pub fn meetup_from_record(record: &RemoteRecord, ctx: &MappingContext) -> Meetup {
    let geo = record.location("geoLocation");
    let time = record.timestamp("time");
    Meetup {
        record_name: record.record_name.clone(),
        name: record.string("name").unwrap_or_default(),
        meetup_id: record.string("meetup_id"),
        description: record.string("meetup_description").unwrap_or_default(),
        latitude: geo.map(|g| g.latitude).unwrap_or(0.0),
        longitude: geo.map(|g| g.longitude).unwrap_or(0.0),
        location: record.string("location").unwrap_or_default(),
        location_name: record.string("locationName").unwrap_or_default(),
        time,
        year: time.unwrap_or(ctx.mapped_at).year(),
        duration: record.int32("duration").unwrap_or(0),
        rsvp_limit: record.int32("rsvp_limit").unwrap_or(0),
        yes_rsvp_count: record.int32("yes_rsvp_count").unwrap_or(0),
        meetup_url: record.string("meetup_url"),
        logo: record.asset_bytes("logo"),
        small_logo: record.asset_bytes("smallLogo"),
        next_event: record.boolean("nextEvent").unwrap_or(false),
    }
}

/// Keep the pass-time fallbacks of the stored copy of `entity`, so a record
/// without `date` (jobs) or `time` (meetups) maps the same on every pass.
pub fn carry_over_fallbacks(
    record: &RemoteRecord,
    entity: &mut Entity,
    previous: Option<&Entity>,
) {
    match (entity, previous) {
        (Entity::Job(job), Some(Entity::Job(stored))) if record.timestamp("date").is_none() => {
            job.date = stored.date;
        }
        (Entity::Meetup(meetup), Some(Entity::Meetup(stored))) if meetup.time.is_none() => {
            meetup.year = stored.year;
        }
        _ => {}
    }
}

pub fn affiliate_link_from_record(record: &RemoteRecord) -> AffiliateLink {
    AffiliateLink {
        record_name: record.record_name.clone(),
    }
}

/// Visible text of an HTML fragment, whitespace collapsed.
pub fn plain_text(markup: &str) -> String {
    let fragment = Html::parse_fragment(markup);
    fragment
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ctx() -> MappingContext {
        MappingContext::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap())
    }

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 19, 0, 0).single().unwrap()
    }

    fn meetup_record(id: &str, time: DateTime<Utc>) -> RemoteRecord {
        RemoteRecord::new(EntityKind::Meetup, id)
            .with_field("name", FieldValue::String(format!("Meetup {id}")))
            .with_field("time", FieldValue::Timestamp(time))
    }

    struct FixedLogo(Vec<u8>);

    #[async_trait]
    impl LogoFetcher for FixedLogo {
        async fn fetch_logo(&self, _pass_id: Uuid, _url: &str) -> Option<Vec<u8>> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn missing_geo_fields_default_to_zero() {
        let company = company_from_record(&RemoteRecord::new(EntityKind::Company, "co-1"));
        assert_eq!((company.latitude, company.longitude), (0.0, 0.0));
        assert_eq!(company.name, None);

        let meetup = meetup_from_record(&RemoteRecord::new(EntityKind::Meetup, "m-1"), &ctx());
        assert_eq!((meetup.latitude, meetup.longitude), (0.0, 0.0));
    }

    #[test]
    fn location_fields_are_read() {
        let record = RemoteRecord::new(EntityKind::Meetup, "m-1").with_field(
            "geoLocation",
            FieldValue::Location(GeoLocation {
                latitude: 52.37,
                longitude: 4.89,
            }),
        );
        let meetup = meetup_from_record(&record, &ctx());
        assert_eq!((meetup.latitude, meetup.longitude), (52.37, 4.89));
    }

    #[test]
    fn missing_contributor_strings_become_empty() {
        let record = RemoteRecord::new(EntityKind::Contributor, "c-1")
            .with_field("commit_count", FieldValue::Int64(42));
        let contributor = contributor_from_record(&record);
        assert_eq!(contributor.name, "");
        assert_eq!(contributor.url, "");
        assert_eq!(contributor.avatar_url, "");
        assert_eq!(contributor.contributor_id, 0);
        assert_eq!(contributor.commit_count, 42);
    }

    #[test]
    fn meetup_year_comes_from_time_not_the_record() {
        let record = meetup_record("m-1", ts(2023, 11, 20)).with_field("year", FieldValue::Int64(1999));
        let meetup = meetup_from_record(&record, &ctx());
        assert_eq!(meetup.year, 2023);

        let untimed = meetup_from_record(&RemoteRecord::new(EntityKind::Meetup, "m-2"), &ctx());
        assert_eq!(untimed.time, None);
        assert_eq!(untimed.year, 2025);
    }

    #[test]
    fn stored_fallbacks_survive_later_passes() {
        let later = MappingContext::new(Utc.with_ymd_and_hms(2027, 1, 2, 0, 0, 0).single().unwrap());

        let dateless = RemoteRecord::new(EntityKind::Job, "j-1");
        let stored = map_record(EntityKind::Job, &dateless, &ctx()).unwrap();
        let mut remapped = map_record(EntityKind::Job, &dateless, &later).unwrap();
        carry_over_fallbacks(&dateless, &mut remapped, Some(&stored));
        assert_eq!(remapped, stored);

        let dated = RemoteRecord::new(EntityKind::Job, "j-1")
            .with_field("date", FieldValue::Timestamp(ts(2026, 4, 1)));
        let mut remapped = map_record(EntityKind::Job, &dated, &later).unwrap();
        carry_over_fallbacks(&dated, &mut remapped, Some(&stored));
        assert_eq!(remapped.as_job().map(|job| job.date), Some(ts(2026, 4, 1)));

        let untimed = RemoteRecord::new(EntityKind::Meetup, "m-1");
        let stored = map_record(EntityKind::Meetup, &untimed, &ctx()).unwrap();
        let mut remapped = map_record(EntityKind::Meetup, &untimed, &later).unwrap();
        carry_over_fallbacks(&untimed, &mut remapped, Some(&stored));
        assert_eq!(remapped.as_meetup().map(|meetup| meetup.year), Some(2025));

        let mut fresh = map_record(EntityKind::Meetup, &untimed, &later).unwrap();
        carry_over_fallbacks(&untimed, &mut fresh, None);
        assert_eq!(fresh.as_meetup().map(|meetup| meetup.year), Some(2027));
    }

    #[test]
    fn mistyped_and_out_of_range_fields_fall_back_to_defaults() {
        let record = RemoteRecord::new(EntityKind::Meetup, "m-1")
            .with_field("name", FieldValue::Int64(7))
            .with_field("duration", FieldValue::String("two hours".into()))
            .with_field("rsvp_limit", FieldValue::Int64(i64::from(i32::MAX) + 1))
            .with_field("yes_rsvp_count", FieldValue::Double(31.9))
            .with_field("nextEvent", FieldValue::Int64(1));
        let mut record = record;
        record
            .fields
            .insert("meetup_url".into(), serde_json::json!({"type": "REFERENCE", "value": "x"}));

        let meetup = meetup_from_record(&record, &ctx());
        assert_eq!(meetup.name, "");
        assert_eq!(meetup.duration, 0);
        assert_eq!(meetup.rsvp_limit, 0);
        assert_eq!(meetup.yes_rsvp_count, 31);
        assert_eq!(meetup.meetup_url, None);
        assert!(meetup.next_event);
    }

    #[test]
    fn empty_job_author_maps_to_no_company() {
        let record = RemoteRecord::new(EntityKind::Job, "j-1")
            .with_field("author", FieldValue::String(String::new()));
        let job = job_from_record(&record, &ctx());
        assert_eq!(job.company_name, None);
        assert_eq!(job.date, ctx().mapped_at);
        assert_eq!(job.title, "");

        let record = record.with_field("author", FieldValue::String("Acme".into()));
        assert_eq!(job_from_record(&record, &ctx()).company_name.as_deref(), Some("Acme"));
    }

    #[test]
    fn structural_problems_are_mapping_errors() {
        let wrong_type = RemoteRecord::new(EntityKind::Job, "j-1");
        assert!(matches!(
            map_record(EntityKind::Meetup, &wrong_type, &ctx()),
            Err(MappingError::WrongRecordType { .. })
        ));

        let unnamed = RemoteRecord::new(EntityKind::Meetup, "  ");
        assert_eq!(
            map_record(EntityKind::Meetup, &unnamed, &ctx()),
            Err(MappingError::MissingIdentifier(EntityKind::Meetup))
        );
    }

    #[test]
    fn affiliate_links_map_to_empty_placeholders() {
        let record = RemoteRecord::new(EntityKind::AffiliateLink, "a-1")
            .with_field("productName", FieldValue::String("Book".into()));
        let entity = map_record(EntityKind::AffiliateLink, &record, &ctx()).unwrap();
        assert_eq!(
            entity,
            Entity::AffiliateLink(AffiliateLink {
                record_name: "a-1".into()
            })
        );
    }

    #[test]
    fn asset_fields_read_files_and_degrade_when_missing() {
        let dir = tempdir().expect("tempdir");
        let logo_path = dir.path().join("logo.png");
        std::fs::write(&logo_path, b"\x89PNG").unwrap();

        let record = RemoteRecord::new(EntityKind::Company, "co-1")
            .with_field("logo", FieldValue::Asset(AssetRef { path: logo_path }))
            .with_field(
                "smallLogo",
                FieldValue::Asset(AssetRef {
                    path: dir.path().join("missing.png"),
                }),
            );
        let company = company_from_record(&record);
        assert_eq!(company.logo.as_deref(), Some(&b"\x89PNG"[..]));
        assert_eq!(company.small_logo, None);
    }

    #[tokio::test]
    async fn job_logo_is_fetched_only_for_valid_urls() {
        let fetcher = FixedLogo(vec![1, 2, 3]);
        let mut job = job_from_record(
            &RemoteRecord::new(EntityKind::Job, "j-1")
                .with_field("logoUrl", FieldValue::String("https://example.com/logo.png".into())),
            &ctx(),
        );
        resolve_job_logo(&mut job, &fetcher, Uuid::nil()).await;
        assert_eq!(job.logo, Some(vec![1, 2, 3]));

        job.logo_url = Some("not a url".into());
        resolve_job_logo(&mut job, &fetcher, Uuid::nil()).await;
        assert_eq!(job.logo, None);

        job.logo_url = None;
        resolve_job_logo(&mut job, &fetcher, Uuid::nil()).await;
        assert_eq!(job.logo, None);
    }

    #[tokio::test]
    async fn memory_store_pages_and_sorts() {
        let store = MemoryRecordStore::with_page_size(2);
        store.replace_all(
            EntityKind::Meetup,
            vec![
                meetup_record("old", ts(2022, 1, 10)),
                meetup_record("new", ts(2025, 1, 10)),
                RemoteRecord::new(EntityKind::Meetup, "untimed"),
                meetup_record("mid", ts(2024, 1, 10)),
            ],
        );

        let query = RecordQuery::for_kind(EntityKind::Meetup);
        let first = store.query(&query, None).await.unwrap();
        assert_eq!(first.cursor.as_deref(), Some("2"));
        let second = store.query(&query, first.cursor.as_deref()).await.unwrap();
        assert_eq!(second.cursor, None);

        let names = first
            .records
            .iter()
            .chain(second.records.iter())
            .map(|r| r.record_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["new", "mid", "old", "untimed"]);
        assert_eq!(store.query_count(), 2);
    }

    #[tokio::test]
    async fn memory_store_injects_page_failures() {
        let store = MemoryRecordStore::with_page_size(1);
        store.replace_all(
            EntityKind::Job,
            vec![
                RemoteRecord::new(EntityKind::Job, "j-1"),
                RemoteRecord::new(EntityKind::Job, "j-2"),
            ],
        );
        store.fail_from_page(1);
        let query = RecordQuery::all(EntityKind::Job);

        let first = store.query(&query, None).await.unwrap();
        assert!(store.query(&query, first.cursor.as_deref()).await.is_err());
        store.recover();
        assert!(store.query(&query, first.cursor.as_deref()).await.is_ok());
    }

    #[tokio::test]
    async fn subscribers_hear_about_created_records() {
        let store = MemoryRecordStore::new();
        let mut meetups = store.subscribe(EntityKind::Meetup).await.unwrap();

        store.insert(EntityKind::Job, RemoteRecord::new(EntityKind::Job, "j-1"));
        store.insert(EntityKind::Meetup, RemoteRecord::new(EntityKind::Meetup, "m-1"));

        let notice = meetups.next().await.unwrap();
        assert_eq!(notice.kind, EntityKind::Meetup);
        assert_eq!(notice.record_name, "m-1");
    }

    #[test]
    fn fixture_dir_loads_records_and_rebases_assets() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("logo.png"), b"logo").unwrap();
        std::fs::write(
            dir.path().join("Meetup.json"),
            r#"[{"recordName": "m-1", "recordType": "Meetup", "fields": {
                "name": {"type": "STRING", "value": "Fixture meetup"},
                "time": {"type": "TIMESTAMP", "value": 1700000000000},
                "logo": {"type": "ASSET", "value": {"path": "logo.png"}}
            }}]"#,
        )
        .unwrap();

        let store = MemoryRecordStore::from_fixture_dir(dir.path()).unwrap();
        let records = store.lock().records.get(&EntityKind::Meetup).cloned().unwrap();
        assert_eq!(records.len(), 1);
        let meetup = meetup_from_record(&records[0], &ctx());
        assert_eq!(meetup.name, "Fixture meetup");
        assert_eq!(meetup.logo.as_deref(), Some(&b"logo"[..]));
        assert_eq!(meetup.year, 2023);
    }

    #[test]
    fn http_page_urls_carry_sort_and_cursor() {
        let fetcher = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let store = HttpRecordStore::new(fetcher, "https://records.example.com/v1/");
        let query = RecordQuery::for_kind(EntityKind::Meetup);

        assert_eq!(
            store.page_url(&query, Some("abc")).unwrap(),
            "https://records.example.com/v1/records/Meetup?sortBy=time&ascending=false&cursor=abc"
        );
        assert_eq!(
            store.page_url(&RecordQuery::all(EntityKind::Job), None).unwrap(),
            "https://records.example.com/v1/records/Job"
        );
    }

    #[test]
    fn plain_text_strips_markup() {
        assert_eq!(
            plain_text("<p>We are <b>hiring</b>!</p>\n<ul><li>Swift</li><li>Rust</li></ul>"),
            "We are hiring ! Swift Rust"
        );
    }
}
