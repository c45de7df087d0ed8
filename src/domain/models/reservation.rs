//! File reservation model and path-pattern intersection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An advisory lease on a path pattern.
///
/// Reservation ids are the sequence numbers of their `file_reserved`
/// events. A reservation terminates on explicit release, TTL expiry, or
/// the holder's end of session; expiry is enforced by filtering, not by a
/// background sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: i64,
    pub project_key: String,
    pub agent: String,
    pub path_pattern: String,
    pub reason: Option<String>,
    pub exclusive: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// A reservation is live iff it has not been released and has not
    /// expired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.released_at.is_none() && self.expires_at > now
    }
}

/// Conflict report for one requested path.
#[derive(Debug, Clone, Serialize)]
pub struct ReservationConflict {
    pub path: String,
    pub holders: Vec<String>,
}

/// Conservative glob-intersection test between two path patterns.
///
/// Returns true when the patterns *may* match a common path. Segments are
/// compared pairwise: `**` swallows any remainder, and a segment containing
/// `*` is treated as matching any single segment. The test errs on the side
/// of intersection, so `a/**` and `a/b/*` intersect while `a/**` and `b/c`
/// do not.
pub fn patterns_intersect(a: &str, b: &str) -> bool {
    let a_segs: Vec<&str> = a.trim_matches('/').split('/').collect();
    let b_segs: Vec<&str> = b.trim_matches('/').split('/').collect();
    segments_intersect(&a_segs, &b_segs)
}

fn segments_intersect(a: &[&str], b: &[&str]) -> bool {
    match (a.first(), b.first()) {
        (None, None) => true,
        (Some(&"**"), _) | (_, Some(&"**")) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some(x), Some(y)) => {
            if segment_matches(x, y) {
                segments_intersect(&a[1..], &b[1..])
            } else {
                false
            }
        }
    }
}

fn segment_matches(x: &str, y: &str) -> bool {
    x.contains('*') || y.contains('*') || x == y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_paths_intersect() {
        assert!(patterns_intersect("src/x.ts", "src/x.ts"));
    }

    #[test]
    fn disjoint_paths_do_not_intersect() {
        assert!(!patterns_intersect("src/x.ts", "src/y.ts"));
        assert!(!patterns_intersect("a/**", "b/c"));
    }

    #[test]
    fn recursive_glob_swallows_deeper_patterns() {
        assert!(patterns_intersect("a/**", "a/b/*"));
        assert!(patterns_intersect("a/b/c", "a/**"));
    }

    #[test]
    fn single_star_matches_one_segment() {
        assert!(patterns_intersect("src/*/mod.rs", "src/hive/mod.rs"));
        assert!(!patterns_intersect("src/*/mod.rs", "src/hive/lib.rs"));
    }

    #[test]
    fn partial_wildcard_segments_are_conservative() {
        // "*.rs" is treated as any-segment, so this intersects even though
        // a precise matcher could disprove it.
        assert!(patterns_intersect("src/*.rs", "src/main.py"));
    }

    #[test]
    fn prefix_without_glob_does_not_intersect_longer_path() {
        assert!(!patterns_intersect("src", "src/x.ts"));
    }

    #[test]
    fn liveness_respects_release_and_expiry() {
        let now = Utc::now();
        let mut r = Reservation {
            id: 1,
            project_key: "p".into(),
            agent: "swift-otter".into(),
            path_pattern: "src/**".into(),
            reason: None,
            exclusive: true,
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
            released_at: None,
        };
        assert!(r.is_live(now));
        r.released_at = Some(now);
        assert!(!r.is_live(now));
        r.released_at = None;
        r.expires_at = now - chrono::Duration::seconds(1);
        assert!(!r.is_live(now));
    }
}
