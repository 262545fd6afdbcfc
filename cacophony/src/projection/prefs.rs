//! Named user preferences.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A stored preference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum PrefValue {
    #[display("{_0}")]
    Int(i32),
    #[display("{_0}")]
    Long(i64),
}

impl PrefValue {
    pub fn as_i64(&self) -> i64 {
        match self {
            PrefValue::Int(v) => i64::from(*v),
            PrefValue::Long(v) => *v,
        }
    }
}

pub const VIDEO_EDGE_PIXEL_MAX: &str = "video_edge_pixel_max";
pub const FOLLOW_CACHE_TARGET_BYTES: &str = "follow_cache_target_bytes";
pub const REPUBLISH_INTERVAL_MILLIS: &str = "republish_interval_millis";
pub const FOLLOWEE_REFRESH_MILLIS: &str = "followee_refresh_millis";
pub const EXPLICIT_CACHE_TARGET_BYTES: &str = "explicit_cache_target_bytes";

const DEFAULT_VIDEO_EDGE_PIXEL_MAX: i32 = 1280;
const DEFAULT_FOLLOW_CACHE_TARGET_BYTES: i64 = 10_000_000_000;
const DEFAULT_REPUBLISH_INTERVAL_MILLIS: i64 = 12 * 60 * 60 * 1000;
const DEFAULT_FOLLOWEE_REFRESH_MILLIS: i64 = 60 * 60 * 1000;
const DEFAULT_EXPLICIT_CACHE_TARGET_BYTES: i64 = 1_000_000_000;

/// Preferences keyed by name. Unset names fall back to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefsData {
    values: BTreeMap<String, PrefValue>,
}

impl PrefsData {
    pub fn get(&self, name: &str) -> Option<PrefValue> {
        self.values.get(name).copied()
    }

    pub(crate) fn set(&mut self, name: String, value: PrefValue) {
        self.values.insert(name, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, PrefValue)> + '_ {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn video_edge_pixel_max(&self) -> i32 {
        match self.get(VIDEO_EDGE_PIXEL_MAX) {
            Some(PrefValue::Int(v)) => v,
            Some(PrefValue::Long(v)) => i32::try_from(v).unwrap_or(DEFAULT_VIDEO_EDGE_PIXEL_MAX),
            None => DEFAULT_VIDEO_EDGE_PIXEL_MAX,
        }
    }

    pub fn follow_cache_target_bytes(&self) -> i64 {
        self.long_or(FOLLOW_CACHE_TARGET_BYTES, DEFAULT_FOLLOW_CACHE_TARGET_BYTES)
    }

    pub fn republish_interval_millis(&self) -> i64 {
        self.long_or(REPUBLISH_INTERVAL_MILLIS, DEFAULT_REPUBLISH_INTERVAL_MILLIS)
    }

    pub fn followee_refresh_millis(&self) -> i64 {
        self.long_or(FOLLOWEE_REFRESH_MILLIS, DEFAULT_FOLLOWEE_REFRESH_MILLIS)
    }

    /// Size the explicit lookup cache is purged down to.
    pub fn explicit_cache_target_bytes(&self) -> i64 {
        self.long_or(EXPLICIT_CACHE_TARGET_BYTES, DEFAULT_EXPLICIT_CACHE_TARGET_BYTES)
    }

    fn long_or(&self, name: &str, default: i64) -> i64 {
        self.get(name).map(|v| v.as_i64()).unwrap_or(default)
    }
}
