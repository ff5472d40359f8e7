//! List view-models over the local store: year-grouped sections, live lists
//! that follow store change events, and deep-link resolution.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chnl_core::{Entity, EntityKind, Meetup};
use chnl_storage::{LocalStore, Snapshot, StoreEvent, StoreObserver};
use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "chnl-view";

/// Anything placed on a timeline by a scheduled time.
pub trait Groupable {
    fn scheduled_time(&self) -> Option<DateTime<Utc>>;
}

impl Groupable for Meetup {
    fn scheduled_time(&self) -> Option<DateTime<Utc>> {
        self.time
    }
}

impl Groupable for Entity {
    fn scheduled_time(&self) -> Option<DateTime<Utc>> {
        self.sort_time()
    }
}

/// Section heading. Orders `Upcoming` first, then years newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionLabel {
    Upcoming,
    Year(i32),
}

impl Ord for SectionLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Upcoming, Self::Upcoming) => Ordering::Equal,
            (Self::Upcoming, Self::Year(_)) => Ordering::Less,
            (Self::Year(_), Self::Upcoming) => Ordering::Greater,
            (Self::Year(a), Self::Year(b)) => b.cmp(a),
        }
    }
}

impl PartialOrd for SectionLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SectionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upcoming => f.write_str("Upcoming"),
            Self::Year(year) => write!(f, "{year}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid section label {0:?}")]
pub struct InvalidSectionLabel(pub String);

impl FromStr for SectionLabel {
    type Err = InvalidSectionLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == "Upcoming" {
            return Ok(Self::Upcoming);
        }
        trimmed
            .parse::<i32>()
            .map(Self::Year)
            .map_err(|_| InvalidSectionLabel(trimmed.to_string()))
    }
}

/// Distinct labels in display order.
pub fn ordered_labels(labels: impl IntoIterator<Item = SectionLabel>) -> Vec<SectionLabel> {
    let mut labels = labels.into_iter().collect::<Vec<_>>();
    labels.sort();
    labels.dedup();
    labels
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section<T> {
    pub label: SectionLabel,
    pub items: Vec<T>,
}

/// Split `entities` into an `Upcoming` section (strictly after
/// `reference_time`, nearest first) and one section per UTC calendar year.
///
/// Year sections keep input order. Entities without a time are left out.
pub fn grouped_view<T>(entities: &[T], reference_time: DateTime<Utc>) -> Vec<Section<T>>
where
    T: Groupable + Clone,
{
    let mut buckets = BTreeMap::<SectionLabel, Vec<T>>::new();
    for entity in entities {
        let Some(time) = entity.scheduled_time() else {
            continue;
        };
        let label = if time > reference_time {
            SectionLabel::Upcoming
        } else {
            SectionLabel::Year(time.year())
        };
        buckets.entry(label).or_default().push(entity.clone());
    }

    if let Some(upcoming) = buckets.get_mut(&SectionLabel::Upcoming) {
        upcoming.sort_by_key(|entity| entity.scheduled_time());
    }

    buckets
        .into_iter()
        .map(|(label, items)| Section { label, items })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListLayout {
    /// Store default order for the kind.
    Flat,
    ByYear { reference_time: DateTime<Utc> },
}

/// Rows of one entity kind kept in step with the local store.
#[derive(Debug, Clone)]
pub struct ListModel {
    kind: EntityKind,
    layout: ListLayout,
    applied_revision: Option<u64>,
    rows: Vec<Entity>,
    sections: Vec<Section<Entity>>,
}

impl ListModel {
    pub fn flat(kind: EntityKind) -> Self {
        Self::with_layout(kind, ListLayout::Flat)
    }

    pub fn grouped_by_year(kind: EntityKind, reference_time: DateTime<Utc>) -> Self {
        Self::with_layout(kind, ListLayout::ByYear { reference_time })
    }

    fn with_layout(kind: EntityKind, layout: ListLayout) -> Self {
        Self {
            kind,
            layout,
            applied_revision: None,
            rows: Vec::new(),
            sections: Vec::new(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn layout(&self) -> ListLayout {
        self.layout
    }

    pub fn revision(&self) -> Option<u64> {
        self.applied_revision
    }

    pub fn rows(&self) -> &[Entity] {
        &self.rows
    }

    /// Empty for flat lists.
    pub fn sections(&self) -> &[Section<Entity>] {
        &self.sections
    }

    pub fn load(&mut self, snapshot: &Snapshot) {
        self.rows = snapshot.list(self.kind);
        self.applied_revision = Some(snapshot.revision());
        self.regroup();
    }

    pub fn set_reference_time(&mut self, reference_time: DateTime<Utc>) {
        if let ListLayout::ByYear { .. } = self.layout {
            self.layout = ListLayout::ByYear { reference_time };
            self.regroup();
        }
    }

    fn regroup(&mut self) {
        self.sections = match self.layout {
            ListLayout::Flat => Vec::new(),
            ListLayout::ByYear { reference_time } => grouped_view(&self.rows, reference_time),
        };
    }

    /// Recompute from the store for `event`. Returns `false` when the event
    /// belongs to another kind or is not newer than what is already shown.
    pub fn apply(&mut self, event: &StoreEvent, store: &LocalStore) -> bool {
        let (kind, revision) = match event {
            StoreEvent::Initial { kind, revision, .. } => (*kind, *revision),
            StoreEvent::Update(change) => (change.kind, change.revision),
            StoreEvent::Error { kind, message } => {
                if *kind != self.kind {
                    return false;
                }
                warn!(%kind, error = %message, "change stream interrupted, reloading list");
                self.load(&store.snapshot());
                return true;
            }
        };

        if kind != self.kind {
            return false;
        }
        if self.applied_revision.is_some_and(|applied| revision <= applied) {
            debug!(%kind, revision, "dropping stale list event");
            return false;
        }
        self.load(&store.snapshot());
        true
    }

    /// Wait for the next event that changes the list. Returns `false` once
    /// the change stream has closed.
    pub async fn next_change(&mut self, store: &LocalStore, observer: &mut StoreObserver) -> bool {
        while let Some(event) = observer.next().await {
            if self.apply(&event, store) {
                return true;
            }
        }
        false
    }
}

/// `"<type>:<identifier>"` reference to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeepLink {
    pub kind: EntityKind,
    pub identifier: String,
}

impl fmt::Display for DeepLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.domain(), self.identifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeepLinkError {
    #[error("deep link {0:?} has no `:` separator")]
    MissingSeparator(String),
    #[error("deep link type {0:?} is not known")]
    UnknownType(String),
    #[error("deep link {0:?} has an empty identifier")]
    EmptyIdentifier(String),
}

/// Split on the first `:`; the identifier may itself contain colons.
pub fn parse_deep_link(raw: &str) -> Result<DeepLink, DeepLinkError> {
    let (tag, identifier) = raw
        .split_once(':')
        .ok_or_else(|| DeepLinkError::MissingSeparator(raw.to_string()))?;
    let kind =
        EntityKind::from_domain(tag).ok_or_else(|| DeepLinkError::UnknownType(tag.to_string()))?;
    if identifier.is_empty() {
        return Err(DeepLinkError::EmptyIdentifier(raw.to_string()));
    }
    Ok(DeepLink {
        kind,
        identifier: identifier.to_string(),
    })
}

impl FromStr for DeepLink {
    type Err = DeepLinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_deep_link(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Display(Entity),
    NotFound,
    /// Remembered until the list becomes active.
    Deferred,
    /// The link targets another list.
    Ignored,
}

/// Resolves deep links for one list. While the list is inactive only the
/// most recent identifier is kept.
#[derive(Debug)]
pub struct DeepLinkResolver {
    kind: EntityKind,
    store: Arc<LocalStore>,
    active: bool,
    pending: Option<String>,
}

impl DeepLinkResolver {
    pub fn new(kind: EntityKind, store: Arc<LocalStore>) -> Self {
        Self {
            kind,
            store,
            active: false,
            pending: None,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    pub fn resolve(&mut self, identifier: &str) -> Resolution {
        if !self.active {
            debug!(kind = %self.kind, identifier, "deferring deep link until list is active");
            self.pending = Some(identifier.to_string());
            return Resolution::Deferred;
        }
        self.lookup(identifier)
    }

    pub fn handle_link(&mut self, link: &DeepLink) -> Resolution {
        if link.kind != self.kind {
            return Resolution::Ignored;
        }
        self.resolve(&link.identifier)
    }

    /// Mark the list active and resolve the deferred identifier, once.
    pub fn activate(&mut self) -> Option<Resolution> {
        self.active = true;
        let identifier = self.pending.take()?;
        Some(self.lookup(&identifier))
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    fn lookup(&self, identifier: &str) -> Resolution {
        match self.store.snapshot().get(self.kind, identifier) {
            Some(entity) => Resolution::Display(entity.clone()),
            None => {
                debug!(kind = %self.kind, identifier, "deep link target not found");
                Resolution::NotFound
            }
        }
    }
}
