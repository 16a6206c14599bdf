//! Stream records, the live set, and the servable snapshot.
//!
//! - [`followed`] - live streams among the followed channels (bearer-guarded, paged by id)
//! - [`public`] - the unauthenticated public channel list
//!
//! Both providers produce a [`StreamRecord`] variant. The live set keys
//! records by case-folded channel name so the diff never needs to know which
//! provider a record came from.

mod followed;
mod public;

pub use followed::{FollowedFeed, FollowedStream};
pub use public::{PublicFeed, PublicStream};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Service tag reported for records from the followed feed.
pub const FOLLOWED_SERVICE: &str = "twitch-followed";

/// One observed live channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    Followed(FollowedStream),
    Public(PublicStream),
}

impl StreamRecord {
    /// Display name of the channel.
    pub fn name(&self) -> &str {
        match self {
            StreamRecord::Followed(s) => &s.user_name,
            StreamRecord::Public(s) => &s.channel,
        }
    }

    pub fn service(&self) -> &str {
        match self {
            StreamRecord::Followed(_) => FOLLOWED_SERVICE,
            StreamRecord::Public(s) => &s.service,
        }
    }

    /// Viewer count, or room occupancy for the public feed.
    pub fn viewers(&self) -> u64 {
        match self {
            StreamRecord::Followed(s) => s.viewer_count,
            StreamRecord::Public(s) => s.rustlers,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            StreamRecord::Followed(s) => &s.title,
            StreamRecord::Public(s) => &s.title,
        }
    }

    pub fn is_followed(&self) -> bool {
        matches!(self, StreamRecord::Followed(_))
    }

    /// Key under which the record is stored in a [`LiveSet`].
    pub fn key(&self) -> String {
        self.name().to_lowercase()
    }
}

/// Currently live channels keyed by lowercase name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveSet {
    records: BTreeMap<String, StreamRecord>,
}

/// Channels that appeared and disappeared between two live sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveDiff {
    pub went_live: Vec<StreamRecord>,
    pub went_offline: Vec<StreamRecord>,
}

impl LiveDiff {
    pub fn is_empty(&self) -> bool {
        self.went_live.is_empty() && self.went_offline.is_empty()
    }
}

impl LiveSet {
    /// Merges both providers' records. Followed records go in first, so a
    /// public record with the same name replaces it.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let followed = snapshot.followed.iter().cloned().map(StreamRecord::Followed);
        let public = snapshot.public.iter().cloned().map(StreamRecord::Public);
        followed.chain(public).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(&name.to_lowercase())
    }

    pub fn get(&self, name: &str) -> Option<&StreamRecord> {
        self.records.get(&name.to_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// `went_live` is `new ∖ self`, `went_offline` is `self ∖ new`. Names in
    /// both sets are not reported, whatever changed about them.
    pub fn diff(&self, new: &LiveSet) -> LiveDiff {
        let went_live = new
            .records
            .iter()
            .filter(|(name, _)| !self.records.contains_key(*name))
            .map(|(_, record)| record.clone())
            .collect();
        let went_offline = self
            .records
            .iter()
            .filter(|(name, _)| !new.records.contains_key(*name))
            .map(|(_, record)| record.clone())
            .collect();
        LiveDiff {
            went_live,
            went_offline,
        }
    }
}

impl FromIterator<StreamRecord> for LiveSet {
    fn from_iter<I: IntoIterator<Item = StreamRecord>>(iter: I) -> Self {
        let records = iter
            .into_iter()
            .map(|record| (record.key(), record))
            .collect();
        Self { records }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotCodecError {
    #[error("Failed to encode snapshot: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode snapshot: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Both providers' stream lists plus freshness metadata.
///
/// The wire form is named MessagePack, so fields are self-describing and the
/// two lists round-trip independently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub followed: Vec<FollowedStream>,
    pub public: Vec<PublicStream>,
    pub last_fetched: DateTime<Utc>,
    pub refresh_interval: Duration,
}

impl Snapshot {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotCodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotCodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn followed(name: &str, viewers: u64) -> FollowedStream {
        FollowedStream {
            user_name: name.to_string(),
            viewer_count: viewers,
            title: format!("{} plays", name),
            ..Default::default()
        }
    }

    fn public(channel: &str, rustlers: u64) -> PublicStream {
        PublicStream {
            channel: channel.to_string(),
            service: "youtube".to_string(),
            rustlers,
            live: true,
            ..Default::default()
        }
    }

    fn live_set(names: &[&str]) -> LiveSet {
        names
            .iter()
            .map(|n| StreamRecord::Followed(followed(n, 1)))
            .collect()
    }

    #[test]
    fn test_keys_are_case_folded() {
        let set = live_set(&["SomeStreamer"]);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["somestreamer"]);
        assert!(set.contains("SOMESTREAMER"));
        assert_eq!(set.get("somestreamer").unwrap().name(), "SomeStreamer");
    }

    #[test]
    fn test_duplicate_names_collapse() {
        let set = live_set(&["abc", "ABC", "Abc"]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_public_wins_on_name_collision() {
        let snapshot = Snapshot {
            followed: vec![followed("Shared", 10)],
            public: vec![public("shared", 3)],
            ..Default::default()
        };
        let set = LiveSet::from_snapshot(&snapshot);
        assert_eq!(set.len(), 1);
        assert!(!set.get("shared").unwrap().is_followed());
    }

    #[test]
    fn test_record_accessors() {
        let f = StreamRecord::Followed(followed("Alpha", 120));
        assert_eq!(f.service(), FOLLOWED_SERVICE);
        assert_eq!(f.viewers(), 120);
        assert!(f.is_followed());

        let p = StreamRecord::Public(public("Beta", 7));
        assert_eq!(p.service(), "youtube");
        assert_eq!(p.viewers(), 7);
        assert_eq!(p.key(), "beta");
    }

    #[test]
    fn test_diff_ignores_changes_to_present_names() {
        let old: LiveSet = vec![StreamRecord::Followed(followed("a", 1))]
            .into_iter()
            .collect();
        let new: LiveSet = vec![StreamRecord::Followed(followed("a", 999))]
            .into_iter()
            .collect();
        assert!(old.diff(&new).is_empty());
    }

    #[test]
    fn test_snapshot_round_trip_empty_and_zero_values() {
        let snapshot = Snapshot::default();
        let decoded = Snapshot::decode(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.refresh_interval, Duration::ZERO);
    }

    #[test]
    fn test_snapshot_round_trip_single_records() {
        let snapshot = Snapshot {
            followed: vec![followed("one", 1)],
            public: vec![public("two", 2)],
            last_fetched: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            refresh_interval: Duration::from_secs(30),
        };
        let decoded = Snapshot::decode(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_snapshot_round_trip_many_records() {
        let snapshot = Snapshot {
            followed: (0..50).map(|i| followed(&format!("f{}", i), i)).collect(),
            public: (0..75).map(|i| public(&format!("p{}", i), i)).collect(),
            last_fetched: Utc::now(),
            refresh_interval: Duration::from_millis(1500),
        };
        let decoded = Snapshot::decode(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Snapshot::decode(b"\xc1\x00garbage").is_err());
    }

    fn name_set() -> impl Strategy<Value = BTreeSet<String>> {
        proptest::collection::btree_set("[a-e]{1,2}", 0..12)
    }

    proptest! {
        #[test]
        fn prop_diff_law(old in name_set(), new in name_set()) {
            let old_refs: Vec<&str> = old.iter().map(String::as_str).collect();
            let new_refs: Vec<&str> = new.iter().map(String::as_str).collect();
            let diff = live_set(&old_refs).diff(&live_set(&new_refs));

            let live: BTreeSet<String> = diff.went_live.iter().map(StreamRecord::key).collect();
            let offline: BTreeSet<String> =
                diff.went_offline.iter().map(StreamRecord::key).collect();

            prop_assert_eq!(live, new.difference(&old).cloned().collect::<BTreeSet<_>>());
            prop_assert_eq!(offline, old.difference(&new).cloned().collect::<BTreeSet<_>>());
            prop_assert_eq!(diff.went_live.len() + diff.went_offline.len(),
                new.symmetric_difference(&old).count());
        }
    }
}
