pub mod test_objects;

use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{anyhow, Result};
use sandkeep_utils::get_epoch_time_in_ms;
use serde::{Deserialize, Serialize};

/// Root namespace for every snapshot key.
pub const SNAPSHOT_ROOT: &str = "snapshots";

/// Scope segment shared by all members of a group chat.
pub const GROUP_SCOPE: &str = "groups";

/// Suffix appended to every snapshot key.
pub const SNAPSHOT_SUFFIX: &str = ".tar.gz";

/// Width of the zero-padded millisecond timestamp embedded in keys. Wide
/// enough that lexicographic order equals numeric order for any u64.
const TIMESTAMP_WIDTH: usize = 20;

fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(anyhow!("{} must not be empty", field));
    }
    if value == "." || value == ".." {
        return Err(anyhow!("{} must not be a relative path segment", field));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':')))
    {
        return Err(anyhow!("{} contains invalid character {:?}", field, c));
    }
    Ok(())
}

/// The logical owner of a set of snapshots.
///
/// Group chats share one scope; private chats are scoped by sender. When a
/// private chat arrives without a sender id the chat id stands in for it,
/// since a private chat's id is the peer's user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    chat_id: String,
    sender_id: Option<String>,
    is_group: bool,
}

impl TenantScope {
    pub fn new(chat_id: &str, sender_id: Option<&str>, is_group: bool) -> Result<Self> {
        validate_segment("chat_id", chat_id)?;
        let sender_id = sender_id.filter(|s| !s.is_empty());
        if let Some(sender_id) = sender_id {
            validate_segment("sender_id", sender_id)?;
        }
        if !is_group && sender_id.unwrap_or(chat_id) == GROUP_SCOPE {
            return Err(anyhow!(
                "a private chat cannot be owned by {:?}, it is reserved for group chats",
                GROUP_SCOPE
            ));
        }
        Ok(Self {
            chat_id: chat_id.to_string(),
            sender_id: sender_id.map(str::to_string),
            is_group,
        })
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn sender_id(&self) -> Option<&str> {
        self.sender_id.as_deref()
    }

    pub fn is_group(&self) -> bool {
        self.is_group
    }

    /// Key namespace for this tenant, always ending in `/`.
    pub fn prefix(&self) -> String {
        let owner = if self.is_group {
            GROUP_SCOPE
        } else {
            self.sender_id.as_deref().unwrap_or(&self.chat_id)
        };
        format!("{}/{}/{}/", SNAPSHOT_ROOT, self.chat_id, owner)
    }

    /// Identifier of the sandbox hosting this chat.
    pub fn sandbox_id(&self) -> String {
        format!("chat-{}", self.chat_id)
    }

    /// Whether `key` lives under this tenant's namespace.
    pub fn owns(&self, key: &str) -> bool {
        let prefix = self.prefix();
        match key.strip_prefix(&prefix) {
            Some(rest) => rest
                .split('/')
                .all(|segment| !segment.is_empty() && segment != "." && segment != ".."),
            None => false,
        }
    }
}

impl Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix().trim_end_matches('/'))
    }
}

/// Issues strictly increasing millisecond timestamps, so two snapshots
/// created within the same millisecond still get distinct, ordered keys.
#[derive(Debug, Default)]
pub struct KeyClock {
    last: AtomicU64,
}

impl KeyClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_timestamp(&self) -> u64 {
        let now = get_epoch_time_in_ms();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }

    pub fn next_key(&self, scope: &TenantScope) -> String {
        snapshot_key(scope, self.next_timestamp())
    }
}

pub fn snapshot_key(scope: &TenantScope, timestamp_ms: u64) -> String {
    format!(
        "{}{:0width$}{}",
        scope.prefix(),
        timestamp_ms,
        SNAPSHOT_SUFFIX,
        width = TIMESTAMP_WIDTH
    )
}

/// Why a snapshot was taken. Free-form; the well-known values are named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SnapshotReason {
    Manual,
    PreReset,
    PreRestart,
    PreFactoryReset,
    RestoreMarkLatest,
    Idle,
    Other(String),
}

impl SnapshotReason {
    pub fn as_str(&self) -> &str {
        match self {
            SnapshotReason::Manual => "manual",
            SnapshotReason::PreReset => "pre-reset",
            SnapshotReason::PreRestart => "pre-restart",
            SnapshotReason::PreFactoryReset => "pre-factory-reset",
            SnapshotReason::RestoreMarkLatest => "restore-mark-latest",
            SnapshotReason::Idle => "idle",
            SnapshotReason::Other(reason) => reason,
        }
    }
}

impl From<&str> for SnapshotReason {
    fn from(value: &str) -> Self {
        match value {
            "manual" => SnapshotReason::Manual,
            "pre-reset" => SnapshotReason::PreReset,
            "pre-restart" => SnapshotReason::PreRestart,
            "pre-factory-reset" => SnapshotReason::PreFactoryReset,
            "restore-mark-latest" => SnapshotReason::RestoreMarkLatest,
            "idle" => SnapshotReason::Idle,
            other => SnapshotReason::Other(other.to_string()),
        }
    }
}

impl From<String> for SnapshotReason {
    fn from(value: String) -> Self {
        SnapshotReason::from(value.as_str())
    }
}

impl From<SnapshotReason> for String {
    fn from(value: SnapshotReason) -> Self {
        value.as_str().to_string()
    }
}

impl Display for SnapshotReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata stored alongside every snapshot archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub chat_id: String,
    pub sender_id: Option<String>,
    pub is_group: bool,
    pub created_at: u64,
    pub directories: Vec<String>,
    pub reason: SnapshotReason,
    pub sha256: Option<String>,
    pub restored_from: Option<String>,
    pub original_uploaded_at: Option<u64>,
}

impl SnapshotMetadata {
    pub fn new(scope: &TenantScope, directories: Vec<String>, reason: SnapshotReason) -> Self {
        Self {
            chat_id: scope.chat_id().to_string(),
            sender_id: scope.sender_id().map(str::to_string),
            is_group: scope.is_group(),
            created_at: get_epoch_time_in_ms(),
            directories,
            reason,
            sha256: None,
            restored_from: None,
            original_uploaded_at: None,
        }
    }

    /// Flatten into string pairs, the shape object stores accept as user
    /// metadata.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("chat_id".to_string(), self.chat_id.clone());
        if let Some(sender_id) = &self.sender_id {
            map.insert("sender_id".to_string(), sender_id.clone());
        }
        map.insert("is_group".to_string(), self.is_group.to_string());
        map.insert("created_at".to_string(), self.created_at.to_string());
        map.insert("directories".to_string(), self.directories.join(","));
        map.insert("reason".to_string(), self.reason.to_string());
        if let Some(sha256) = &self.sha256 {
            map.insert("sha256".to_string(), sha256.clone());
        }
        if let Some(restored_from) = &self.restored_from {
            map.insert("restored_from".to_string(), restored_from.clone());
        }
        if let Some(uploaded_at) = self.original_uploaded_at {
            map.insert("original_uploaded_at".to_string(), uploaded_at.to_string());
        }
        map
    }

    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let required = |name: &str| {
            map.get(name)
                .cloned()
                .ok_or_else(|| anyhow!("snapshot metadata is missing {}", name))
        };
        let directories = required("directories")?
            .split(',')
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            chat_id: required("chat_id")?,
            sender_id: map.get("sender_id").cloned(),
            is_group: required("is_group")?.parse()?,
            created_at: required("created_at")?.parse()?,
            directories,
            reason: SnapshotReason::from(required("reason")?),
            sha256: map.get("sha256").cloned(),
            restored_from: map.get("restored_from").cloned(),
            original_uploaded_at: map
                .get("original_uploaded_at")
                .map(|v| v.parse())
                .transpose()?,
        })
    }
}

/// A catalog entry as returned by listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub key: String,
    pub size: u64,
    pub uploaded_at: u64,
}

/// Pick the newest snapshot. Keys embed a fixed-width timestamp, so the
/// lexicographically greatest key is the most recent one.
pub fn select_latest(snapshots: &[SnapshotInfo]) -> Option<&SnapshotInfo> {
    snapshots.iter().max_by(|a, b| a.key.cmp(&b.key))
}

/// Newest upload first; equal upload times fall back to key order.
pub fn sort_newest_first(snapshots: &mut [SnapshotInfo]) {
    snapshots.sort_by(|a, b| {
        b.uploaded_at
            .cmp(&a.uploaded_at)
            .then_with(|| b.key.cmp(&a.key))
    });
}

/// Which snapshots a delete applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteSelector {
    All,
    Key(String),
}

impl DeleteSelector {
    pub fn parse(value: &str) -> Self {
        if value == "all" {
            DeleteSelector::All
        } else {
            DeleteSelector::Key(value.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_objects::tests::{group_scope, private_scope, TEST_CHAT_ID, TEST_SENDER_ID};

    fn info(key: &str, uploaded_at: u64) -> SnapshotInfo {
        SnapshotInfo {
            key: key.to_string(),
            size: 1,
            uploaded_at,
        }
    }

    #[test]
    fn test_prefix_derivation() {
        assert_eq!(
            private_scope().prefix(),
            format!("snapshots/{}/{}/", TEST_CHAT_ID, TEST_SENDER_ID)
        );
        assert_eq!(
            group_scope().prefix(),
            format!("snapshots/{}/groups/", TEST_CHAT_ID)
        );
        // group members share a prefix regardless of sender
        let other_member = TenantScope::new(TEST_CHAT_ID, Some("someone-else"), true).unwrap();
        assert_eq!(other_member.prefix(), group_scope().prefix());
    }

    #[test]
    fn test_private_owner_cannot_shadow_group_namespace() {
        assert!(TenantScope::new(TEST_CHAT_ID, Some(GROUP_SCOPE), false).is_err());
        assert!(TenantScope::new(GROUP_SCOPE, None, false).is_err());
        // inside a group the sender id never reaches the prefix
        let member = TenantScope::new(TEST_CHAT_ID, Some(GROUP_SCOPE), true).unwrap();
        assert_eq!(member.prefix(), group_scope().prefix());
    }

    #[test]
    fn test_private_chat_without_sender_uses_chat_id() {
        let scope = TenantScope::new("4242", None, false).unwrap();
        assert_eq!(scope.prefix(), "snapshots/4242/4242/");
        let empty_sender = TenantScope::new("4242", Some(""), false).unwrap();
        assert_eq!(empty_sender.prefix(), scope.prefix());
    }

    #[test]
    fn test_invalid_segments_rejected() {
        assert!(TenantScope::new("", None, false).is_err());
        assert!(TenantScope::new("..", None, false).is_err());
        assert!(TenantScope::new("a/b", None, false).is_err());
        assert!(TenantScope::new("123", Some("x y"), false).is_err());
        assert!(TenantScope::new("-100123", Some("u_1"), false).is_ok());
    }

    #[test]
    fn test_owns() {
        let scope = private_scope();
        let key = snapshot_key(&scope, 5);
        assert!(scope.owns(&key));
        assert!(!scope.owns(&scope.prefix()));
        assert!(!group_scope().owns(&key));
        let neighbour = TenantScope::new(&format!("{}0", TEST_CHAT_ID), None, true).unwrap();
        assert!(!group_scope().owns(&snapshot_key(&neighbour, 5)));
    }

    #[test]
    fn test_sandbox_id() {
        assert_eq!(private_scope().sandbox_id(), format!("chat-{}", TEST_CHAT_ID));
    }

    #[test]
    fn test_key_clock_is_strictly_increasing() {
        let clock = KeyClock::new();
        let mut previous = clock.next_timestamp();
        for _ in 0..1000 {
            let next = clock.next_timestamp();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_keys_sort_by_time() {
        let scope = private_scope();
        let early = snapshot_key(&scope, 9);
        let late = snapshot_key(&scope, 10);
        assert!(early < late);
        assert!(late.ends_with(SNAPSHOT_SUFFIX));
    }

    #[test]
    fn test_select_latest() {
        let snapshots = vec![info("t-002", 3), info("t-010", 1), info("t-001", 2)];
        assert_eq!(select_latest(&snapshots).unwrap().key, "t-010");
        assert!(select_latest(&[]).is_none());
    }

    #[test]
    fn test_sort_newest_first() {
        let mut snapshots = vec![info("a", 1), info("b", 3), info("c", 2), info("d", 3)];
        sort_newest_first(&mut snapshots);
        let keys: Vec<_> = snapshots.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["d", "b", "c", "a"]);
    }

    #[test]
    fn test_metadata_map_conversion() {
        let mut metadata = SnapshotMetadata::new(
            &private_scope(),
            vec!["root/.claude".to_string(), "workspace".to_string()],
            SnapshotReason::PreRestart,
        );
        metadata.restored_from = Some("snapshots/x/y/1.tar.gz".to_string());
        metadata.original_uploaded_at = Some(77);
        let map = metadata.to_map();
        assert_eq!(map.get("reason").unwrap(), "pre-restart");
        assert_eq!(SnapshotMetadata::from_map(&map).unwrap(), metadata);
    }

    #[test]
    fn test_metadata_missing_field() {
        let err = SnapshotMetadata::from_map(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_reason_free_form() {
        assert_eq!(SnapshotReason::from("pre-reset"), SnapshotReason::PreReset);
        let custom = SnapshotReason::from("before-upgrade");
        assert_eq!(custom, SnapshotReason::Other("before-upgrade".to_string()));
        assert_eq!(custom.to_string(), "before-upgrade");
    }

    #[test]
    fn test_delete_selector() {
        assert_eq!(DeleteSelector::parse("all"), DeleteSelector::All);
        assert_eq!(
            DeleteSelector::parse("snapshots/1/2/3.tar.gz"),
            DeleteSelector::Key("snapshots/1/2/3.tar.gz".to_string())
        );
    }
}
