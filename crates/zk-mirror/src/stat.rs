//! Version metadata attached to every node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node metadata as reported by the coordination service.
///
/// Plain `Copy` value: every read and write hands out an independent copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stat {
    /// Transaction id that created the node
    pub czxid: i64,
    /// Transaction id that last modified the node's data
    pub mzxid: i64,
    /// Creation time in milliseconds since epoch
    pub ctime: i64,
    /// Last modification time in milliseconds since epoch
    pub mtime: i64,
    /// Number of data changes
    pub version: i32,
    /// Number of child list changes
    pub cversion: i32,
    /// Number of ACL changes
    pub aversion: i32,
    /// Session id of the owner if ephemeral, 0 otherwise
    pub ephemeral_owner: i64,
    /// Length of the data payload
    pub data_length: i32,
    /// Number of children
    pub num_children: i32,
    /// Transaction id that last modified the child list
    pub pzxid: i64,
}

impl Stat {
    /// Whether `self` describes a state no older than `other`, comparing
    /// (mzxid, pzxid).
    pub fn is_at_least(&self, other: &Stat) -> bool {
        (self.mzxid, self.pzxid) >= (other.mzxid, other.pzxid)
    }

    /// Labelled fields, formatted for display.
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        vec![
            ("czxid", self.czxid.to_string()),
            ("mzxid", self.mzxid.to_string()),
            ("ctime", format_millis(self.ctime)),
            ("mtime", format_millis(self.mtime)),
            ("version", self.version.to_string()),
            ("cversion", self.cversion.to_string()),
            ("aversion", self.aversion.to_string()),
            ("ephemeralOwner", self.ephemeral_owner.to_string()),
            ("dataLength", self.data_length.to_string()),
            ("numChildren", self.num_children.to_string()),
            ("pzxid", self.pzxid.to_string()),
        ]
    }
}

fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_at_least_orders_by_zxid() {
        let older = Stat {
            mzxid: 4,
            pzxid: 2,
            ..Default::default()
        };
        let newer = Stat {
            mzxid: 7,
            pzxid: 2,
            ..Default::default()
        };
        assert!(newer.is_at_least(&older));
        assert!(!older.is_at_least(&newer));
        assert!(older.is_at_least(&older));
    }

    #[test]
    fn test_describe_formats_times() {
        let stat = Stat {
            ctime: 0,
            mtime: 1_700_000_000_000,
            version: 3,
            ..Default::default()
        };
        let fields = stat.describe();
        assert_eq!(fields.len(), 11);
        assert_eq!(fields[2], ("ctime", "1970-01-01T00:00:00+00:00".to_string()));
        assert!(fields[3].1.starts_with("2023-11-14T"));
        assert_eq!(fields[4], ("version", "3".to_string()));
    }

    #[test]
    fn test_stat_serialization() {
        let stat = Stat {
            num_children: 2,
            ..Default::default()
        };
        let json = serde_json::to_string(&stat).unwrap();
        assert!(json.contains("\"numChildren\":2"));
        assert!(json.contains("\"ephemeralOwner\":0"));
    }
}
