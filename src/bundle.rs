//! The synchronized user data bundle and its buckets.
//!
//! A bundle is split into independently hashed buckets. The server sends a
//! hash per bucket; the client stores it next to the content and sends it
//! back on delta sync so only stale buckets are transferred.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{SyncError, SyncResult};

/// A named slice of the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Menu,
    Permissions,
    Screens,
    AvailableContexts,
    Glossary,
    Strings,
}

impl Bucket {
    pub const ALL: [Bucket; 6] = [
        Bucket::Menu,
        Bucket::Permissions,
        Bucket::Screens,
        Bucket::AvailableContexts,
        Bucket::Glossary,
        Bucket::Strings,
    ];

    /// Wire name, also used as the storage key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Menu => "menu",
            Bucket::Permissions => "permissions",
            Bucket::Screens => "screens",
            Bucket::AvailableContexts => "available_contexts",
            Bucket::Glossary => "glossary",
            Bucket::Strings => "strings",
        }
    }

    /// Parse a comma separated list such as `menu,screens`.
    pub fn parse_list(s: &str) -> SyncResult<Vec<Bucket>> {
        let mut buckets = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let bucket: Bucket = part.parse()?;
            if !buckets.contains(&bucket) {
                buckets.push(bucket);
            }
        }
        Ok(buckets)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bucket {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bucket::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| SyncError::InvalidData(format!("unknown bucket: {s}")))
    }
}

/// Entry of the navigation menu.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub key: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Slot name → screen key.
    #[serde(default)]
    pub screens: BTreeMap<String, String>,
    #[serde(default)]
    pub children: Vec<MenuItem>,
}

/// Server-driven screen definition. Template and slot payloads are opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenBundle {
    pub screen_key: String,
    pub screen_type: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub template: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A role/school combination the user can switch into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub role_id: String,
    pub role_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub academic_unit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub academic_unit_name: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Client-side cache of every synchronized bucket.
///
/// Every bucket listed in `hashes` holds content that was accepted with that
/// hash. Buckets without a hash entry are empty and were never synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDataBundle {
    #[serde(default)]
    pub menu: Vec<MenuItem>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub screens: BTreeMap<String, ScreenBundle>,
    #[serde(default)]
    pub available_contexts: Vec<UserContext>,
    #[serde(default)]
    pub glossary: BTreeMap<String, String>,
    #[serde(default)]
    pub strings: BTreeMap<String, String>,
    #[serde(default)]
    pub hashes: BTreeMap<Bucket, String>,
    pub synced_at: DateTime<Utc>,
}

impl Default for UserDataBundle {
    fn default() -> Self {
        Self {
            menu: Vec::new(),
            permissions: Vec::new(),
            screens: BTreeMap::new(),
            available_contexts: Vec::new(),
            glossary: BTreeMap::new(),
            strings: BTreeMap::new(),
            hashes: BTreeMap::new(),
            synced_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl UserDataBundle {
    /// Buckets that carry synced content, in canonical order.
    pub fn present_buckets(&self) -> Vec<Bucket> {
        self.hashes.keys().copied().collect()
    }

    pub fn hash_of(&self, bucket: Bucket) -> Option<&str> {
        self.hashes.get(&bucket).map(String::as_str)
    }

    /// JSON form of one bucket's content.
    pub fn bucket_value(&self, bucket: Bucket) -> SyncResult<Value> {
        let value = match bucket {
            Bucket::Menu => serde_json::to_value(&self.menu)?,
            Bucket::Permissions => serde_json::to_value(&self.permissions)?,
            Bucket::Screens => serde_json::to_value(&self.screens)?,
            Bucket::AvailableContexts => serde_json::to_value(&self.available_contexts)?,
            Bucket::Glossary => serde_json::to_value(&self.glossary)?,
            Bucket::Strings => serde_json::to_value(&self.strings)?,
        };
        Ok(value)
    }

    /// Replace one bucket's content from JSON. The hash is left untouched.
    pub fn set_bucket_value(&mut self, bucket: Bucket, value: &Value) -> SyncResult<()> {
        let wrap = |e: serde_json::Error| SyncError::Decoding(format!("bucket {bucket}: {e}"));
        match bucket {
            Bucket::Menu => self.menu = Deserialize::deserialize(value).map_err(wrap)?,
            Bucket::Permissions => self.permissions = Deserialize::deserialize(value).map_err(wrap)?,
            Bucket::Screens => self.screens = Deserialize::deserialize(value).map_err(wrap)?,
            Bucket::AvailableContexts => {
                self.available_contexts = Deserialize::deserialize(value).map_err(wrap)?
            }
            Bucket::Glossary => self.glossary = Deserialize::deserialize(value).map_err(wrap)?,
            Bucket::Strings => self.strings = Deserialize::deserialize(value).map_err(wrap)?,
        }
        Ok(())
    }

    /// Decode `value` into `bucket` and record `hash` for it.
    pub fn apply_bucket(&mut self, bucket: Bucket, value: &Value, hash: String) -> SyncResult<()> {
        self.set_bucket_value(bucket, value)?;
        self.hashes.insert(bucket, hash);
        Ok(())
    }

    /// Copy one bucket's content and hash from `other`.
    fn copy_bucket_from(&mut self, other: &UserDataBundle, bucket: Bucket) {
        match bucket {
            Bucket::Menu => self.menu = other.menu.clone(),
            Bucket::Permissions => self.permissions = other.permissions.clone(),
            Bucket::Screens => self.screens = other.screens.clone(),
            Bucket::AvailableContexts => {
                self.available_contexts = other.available_contexts.clone()
            }
            Bucket::Glossary => self.glossary = other.glossary.clone(),
            Bucket::Strings => self.strings = other.strings.clone(),
        }
        match other.hashes.get(&bucket) {
            Some(hash) => {
                self.hashes.insert(bucket, hash.clone());
            }
            None => {
                self.hashes.remove(&bucket);
            }
        }
    }

    /// Merge a partial bundle. Buckets carried by `partial` win, every other
    /// bucket is kept as is. Merging the same partial twice is a no-op.
    pub fn merge(&mut self, partial: &UserDataBundle) {
        for bucket in partial.present_buckets() {
            self.copy_bucket_from(partial, bucket);
        }
        self.synced_at = self.synced_at.max(partial.synced_at);
    }
}

/// Check that `value` decodes as the content of `bucket` without keeping it.
pub fn check_bucket(bucket: Bucket, value: &Value) -> SyncResult<()> {
    let checked = match bucket {
        Bucket::Menu => Vec::<MenuItem>::deserialize(value).map(drop),
        Bucket::Permissions => Vec::<String>::deserialize(value).map(drop),
        Bucket::Screens => BTreeMap::<String, ScreenBundle>::deserialize(value).map(drop),
        Bucket::AvailableContexts => Vec::<UserContext>::deserialize(value).map(drop),
        Bucket::Glossary | Bucket::Strings => {
            BTreeMap::<String, String>::deserialize(value).map(drop)
        }
    };
    checked.map_err(|e| SyncError::Decoding(format!("bucket {bucket}: {e}")))
}

/// Bucket payloads as the server sent them, next to their decoded form.
///
/// The store persists the raw JSON so the bytes on disk still hash to the
/// value the server advertised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceivedBundle {
    pub bundle: UserDataBundle,
    raw: BTreeMap<Bucket, Value>,
}

impl ReceivedBundle {
    pub fn new(synced_at: DateTime<Utc>) -> Self {
        Self {
            bundle: UserDataBundle {
                synced_at,
                ..UserDataBundle::default()
            },
            raw: BTreeMap::new(),
        }
    }

    /// Decode `value` into `bucket`, keeping the JSON itself for storage.
    pub fn insert(&mut self, bucket: Bucket, value: Value, hash: String) -> SyncResult<()> {
        self.bundle.apply_bucket(bucket, &value, hash)?;
        self.raw.insert(bucket, value);
        Ok(())
    }

    pub fn raw(&self, bucket: Bucket) -> Option<&Value> {
        self.raw.get(&bucket)
    }

    /// Buckets with their raw JSON and hash, in bucket order.
    pub fn entries(&self) -> impl Iterator<Item = (Bucket, &Value, &str)> + '_ {
        self.raw.iter().filter_map(|(bucket, value)| {
            self.bundle
                .hash_of(*bucket)
                .map(|hash| (*bucket, value, hash))
        })
    }

    pub fn into_bundle(self) -> UserDataBundle {
        self.bundle
    }
}

/// BLAKE3 hex digest of the canonical (key-sorted, compact) JSON of a bucket.
pub fn content_hash(value: &Value) -> String {
    blake3::hash(value.to_string().as_bytes()).to_hex().to_string()
}

/// Check a bucket payload against the hash the server advertised for it.
pub fn verify_hash(bucket: Bucket, value: &Value, expected: &str) -> SyncResult<()> {
    let actual = content_hash(value);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(SyncError::InvalidData(format!(
            "hash mismatch for bucket {bucket}: expected {expected}, got {actual}"
        )))
    }
}
