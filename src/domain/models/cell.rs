//! Work-item ("cell") model for the hive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::CellRelationship;
use crate::domain::errors::{DomainError, DomainResult};

/// Kind of work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Bug,
    Feature,
    #[default]
    Task,
    Epic,
    Chore,
    Message,
}

impl CellType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Task => "task",
            Self::Epic => "epic",
            Self::Chore => "chore",
            Self::Message => "message",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bug" => Some(Self::Bug),
            "feature" => Some(Self::Feature),
            "task" => Some(Self::Task),
            "epic" => Some(Self::Epic),
            "chore" => Some(Self::Chore),
            "message" => Some(Self::Message),
            _ => None,
        }
    }
}

/// Cell lifecycle state.
///
/// `open → in_progress → {blocked, closed}; blocked → in_progress;
/// closed → open (reopen); any → tombstone (delete)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Closed,
    Tombstone,
}

impl CellStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
            Self::Tombstone => "tombstone",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "closed" => Some(Self::Closed),
            "tombstone" => Some(Self::Tombstone),
            _ => None,
        }
    }

    /// Validate a status-change transition. Close, reopen, and delete are
    /// separate operations with their own rules and are not routed here.
    pub fn validate_transition(self, to: CellStatus) -> DomainResult<()> {
        let ok = matches!(
            (self, to),
            (Self::Open, Self::InProgress)
                | (Self::InProgress, Self::Blocked)
                | (Self::InProgress, Self::Closed)
                | (Self::Blocked, Self::InProgress)
        );
        if ok {
            Ok(())
        } else {
            Err(DomainError::InvalidStatusTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

/// A persistent work item tracked in the hive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub id: String,
    pub project_key: String,
    pub cell_type: CellType,
    pub status: CellStatus,
    pub title: String,
    pub description: String,
    /// 0 is most urgent, 3 least.
    pub priority: i64,
    pub parent_id: Option<String>,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_reason: Option<String>,
    /// Cached blocked flag maintained by the projection engine.
    pub blocked: bool,
}

/// A typed edge between two cells. For `blocks`, `from_cell` is the
/// blocker and `to_cell` the blocked cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellDependency {
    pub from_cell: String,
    pub to_cell: String,
    pub relationship: CellRelationship,
}

/// A comment on a cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellComment {
    pub id: String,
    pub cell_id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a cell.
#[derive(Debug, Clone, Default)]
pub struct NewCell {
    pub cell_type: CellType,
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub parent_id: Option<String>,
    pub assignee: Option<String>,
}

const ID_SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a cell id: `{slug}-{hash6}-{base36-millis}{rand3}`.
///
/// The slug comes from the project's discoverable package name (else
/// `cell`), the 6-hex-digit hash fingerprints the project key, and the
/// base36 timestamp plus a 3-character random suffix keep ids unique and
/// roughly sortable by creation time.
pub fn generate_cell_id(slug: &str, project_key: &str, now: DateTime<Utc>) -> String {
    use rand::Rng;
    let millis = now.timestamp_millis().max(0) as u64;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..3)
        .map(|_| ID_SUFFIX_ALPHABET[rng.gen_range(0..ID_SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!(
        "{slug}-{}-{}{suffix}",
        project_hash6(project_key),
        to_base36(millis)
    )
}

/// First six hex digits of an FNV-1a fingerprint of the project key.
pub fn project_hash6(project_key: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in project_key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{hash:016x}")[..6].to_string()
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(ID_SUFFIX_ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 digits are ascii")
}

/// Normalize a package name into a cell-id slug: lowercase alphanumerics
/// with runs of anything else collapsed to single dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "cell".to_string()
    } else {
        slug
    }
}
