//! Version id ordering.
//!
//! Release ids compare segment by segment, numerically where both segments
//! are numbers (`1.10.0` > `1.2.0`). A qualified id (`1.0.0-SNAPSHOT`,
//! `1.0.0-rc1`) sorts before the plain release with the same numeric core.

use std::cmp::Ordering;

/// Suffix marking a mutable, branch-head build.
pub const SNAPSHOT_SUFFIX: &str = "-SNAPSHOT";

/// Whether `version` is a snapshot (mutable) version.
pub fn is_snapshot(version: &str) -> bool {
    version.ends_with(SNAPSHOT_SUFFIX)
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Number(u64),
    Text(&'a str),
}

impl Ord for Segment<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Segment::Number(a), Segment::Number(b)) => a.cmp(b),
            // Numbers rank above words: 1.0.1 > 1.0.beta
            (Segment::Number(_), Segment::Text(_)) => Ordering::Greater,
            (Segment::Text(_), Segment::Number(_)) => Ordering::Less,
            (Segment::Text(a), Segment::Text(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Segment<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

const ZERO: Segment<'static> = Segment::Number(0);

fn segments(core: &str) -> Vec<Segment<'_>> {
    core.split('.')
        .map(|s| match s.parse::<u64>() {
            Ok(n) => Segment::Number(n),
            Err(_) => Segment::Text(s),
        })
        .collect()
}

/// Total order over version ids.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a_core, a_qualifier) = split_qualifier(a);
    let (b_core, b_qualifier) = split_qualifier(b);

    let a_segments = segments(a_core);
    let b_segments = segments(b_core);
    let len = a_segments.len().max(b_segments.len());
    for i in 0..len {
        let left = a_segments.get(i).unwrap_or(&ZERO);
        let right = b_segments.get(i).unwrap_or(&ZERO);
        match left.cmp(right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    let qualified = match (a_qualifier, b_qualifier) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(y),
    };

    // Fall back to the raw text so distinct ids never compare equal.
    qualified.then_with(|| a.cmp(b))
}

fn split_qualifier(version: &str) -> (&str, Option<&str>) {
    match version.split_once('-') {
        Some((core, qualifier)) => (core, Some(qualifier)),
        None => (version, None),
    }
}

/// Sort version ids ascending (oldest release first).
pub fn sort_versions(versions: &mut [String]) {
    versions.sort_by(|a, b| compare_versions(a, b));
}
