//! Core domain model for the CocoaHeadsNL record cache.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "chnl-core";

/// Every record type the cache knows how to sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Company,
    Contributor,
    Job,
    Meetup,
    AffiliateLink,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Company,
        EntityKind::Contributor,
        EntityKind::Job,
        EntityKind::Meetup,
        EntityKind::AffiliateLink,
    ];

    /// Record type name used by the remote record store.
    pub fn record_type(self) -> &'static str {
        match self {
            Self::Company => "Company",
            Self::Contributor => "Contributor",
            Self::Job => "Job",
            Self::Meetup => "Meetup",
            Self::AffiliateLink => "AffiliateLink",
        }
    }

    /// Lowercase tag used in search keys and deep links (`meetup:<id>`).
    pub fn domain(self) -> &'static str {
        match self {
            Self::Company => "company",
            Self::Contributor => "contributor",
            Self::Job => "job",
            Self::Meetup => "meetup",
            Self::AffiliateLink => "affiliate_link",
        }
    }

    pub fn from_record_type(record_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.record_type() == record_type)
    }

    pub fn from_domain(domain: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.domain() == domain)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.domain())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEntityKind(pub String);

impl fmt::Display for UnknownEntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown entity kind `{}`", self.0)
    }
}

impl std::error::Error for UnknownEntityKind {}

impl FromStr for EntityKind {
    type Err = UnknownEntityKind;

    /// Accepts either the domain tag (`meetup`) or the record type (`Meetup`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::from_domain(trimmed)
            .or_else(|| Self::from_record_type(trimmed))
            .or_else(|| {
                Self::ALL.into_iter().find(|kind| {
                    kind.record_type().eq_ignore_ascii_case(trimmed)
                        || kind.domain().eq_ignore_ascii_case(trimmed)
                })
            })
            .ok_or_else(|| UnknownEntityKind(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Company {
    pub record_name: String,
    pub name: Option<String>,
    pub place: Option<String>,
    pub street_address: Option<String>,
    pub website: Option<String>,
    pub zip_code: Option<String>,
    pub description: Option<String>,
    pub email_address: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub logo: Option<Vec<u8>>,
    pub small_logo: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contributor {
    pub record_name: String,
    pub name: String,
    pub url: String,
    pub avatar_url: String,
    pub contributor_id: i64,
    /// Sole sort key for contributor lists, descending.
    pub commit_count: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub record_name: String,
    pub title: String,
    /// May contain HTML markup.
    pub content: String,
    pub date: DateTime<Utc>,
    pub link: String,
    pub logo_url: Option<String>,
    /// Bytes resolved from `logo_url` while the record is mapped.
    pub logo: Option<Vec<u8>>,
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meetup {
    pub record_name: String,
    pub name: String,
    pub meetup_id: Option<String>,
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
    pub location: String,
    pub location_name: String,
    pub time: Option<DateTime<Utc>>,
    /// Derived from `time` when the record is mapped, never read from the record.
    pub year: i32,
    pub duration: i32,
    pub rsvp_limit: i32,
    pub yes_rsvp_count: i32,
    pub meetup_url: Option<String>,
    pub logo: Option<Vec<u8>>,
    pub small_logo: Option<Vec<u8>>,
    pub next_event: bool,
}

/// Placeholder entity: the remote type exists but carries no mapped fields yet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AffiliateLink {
    pub record_name: String,
}

/// Any cached entity, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    Company(Company),
    Contributor(Contributor),
    Job(Job),
    Meetup(Meetup),
    AffiliateLink(AffiliateLink),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Company(_) => EntityKind::Company,
            Self::Contributor(_) => EntityKind::Contributor,
            Self::Job(_) => EntityKind::Job,
            Self::Meetup(_) => EntityKind::Meetup,
            Self::AffiliateLink(_) => EntityKind::AffiliateLink,
        }
    }

    /// External record identifier; the identity used by reconciliation.
    pub fn id(&self) -> &str {
        match self {
            Self::Company(c) => &c.record_name,
            Self::Contributor(c) => &c.record_name,
            Self::Job(j) => &j.record_name,
            Self::Meetup(m) => &m.record_name,
            Self::AffiliateLink(a) => &a.record_name,
        }
    }

    /// Human-facing label for list rows.
    pub fn display_name(&self) -> &str {
        match self {
            Self::Company(c) => c.name.as_deref().unwrap_or(&c.record_name),
            Self::Contributor(c) => &c.name,
            Self::Job(j) => &j.title,
            Self::Meetup(m) => &m.name,
            Self::AffiliateLink(a) => &a.record_name,
        }
    }

    /// Time used for most-recent-first ordering, when the kind has one.
    pub fn sort_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Job(j) => Some(j.date),
            Self::Meetup(m) => m.time,
            _ => None,
        }
    }

    pub fn as_meetup(&self) -> Option<&Meetup> {
        match self {
            Self::Meetup(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&Job> {
        match self {
            Self::Job(j) => Some(j),
            _ => None,
        }
    }

    pub fn as_contributor(&self) -> Option<&Contributor> {
        match self {
            Self::Contributor(c) => Some(c),
            _ => None,
        }
    }
}

impl From<Company> for Entity {
    fn from(value: Company) -> Self {
        Self::Company(value)
    }
}

impl From<Contributor> for Entity {
    fn from(value: Contributor) -> Self {
        Self::Contributor(value)
    }
}

impl From<Job> for Entity {
    fn from(value: Job) -> Self {
        Self::Job(value)
    }
}

impl From<Meetup> for Entity {
    fn from(value: Meetup) -> Self {
        Self::Meetup(value)
    }
}

impl From<AffiliateLink> for Entity {
    fn from(value: AffiliateLink) -> Self {
        Self::AffiliateLink(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_from_domain_and_record_type() {
        assert_eq!("meetup".parse::<EntityKind>().unwrap(), EntityKind::Meetup);
        assert_eq!("Contributor".parse::<EntityKind>().unwrap(), EntityKind::Contributor);
        assert_eq!("JOB".parse::<EntityKind>().unwrap(), EntityKind::Job);
        assert_eq!(
            "affiliate_link".parse::<EntityKind>().unwrap(),
            EntityKind::AffiliateLink
        );
        assert!("talk".parse::<EntityKind>().is_err());
    }

    #[test]
    fn entity_exposes_identity_and_kind() {
        let entity = Entity::from(Contributor {
            record_name: "c-1".into(),
            name: "Ada".into(),
            ..Default::default()
        });
        assert_eq!(entity.id(), "c-1");
        assert_eq!(entity.kind(), EntityKind::Contributor);
        assert_eq!(entity.display_name(), "Ada");
        assert!(entity.sort_time().is_none());
    }
}
