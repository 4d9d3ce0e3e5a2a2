//! Tagged value types for the identifiers spec.md describes as untyped
//! associative-array keys (§9 DESIGN NOTES: "re-architect as tagged value
//! types with explicit ownership").

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(AccountId);
string_id!(ReplicaId);
string_id!(Region);
string_id!(Host);
string_id!(SyncId);
string_id!(RequestId);

/// Redundancy index `{0, 1}` (spec.md §3 "Instance bucket").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Bucket {
    Zero,
    One,
}

pub const BUCKETS: [Bucket; 2] = [Bucket::Zero, Bucket::One];

impl Bucket {
    pub fn as_index(self) -> usize {
        match self {
            Bucket::Zero => 0,
            Bucket::One => 1,
        }
    }

    /// region URL suffix letter: `'a' + bucket` (spec.md §6 REST provisioning API).
    pub fn as_region_suffix(self) -> char {
        (b'a' + self.as_index() as u8) as char
    }
}

impl From<Bucket> for u8 {
    fn from(b: Bucket) -> Self {
        b.as_index() as u8
    }
}

impl TryFrom<u8> for Bucket {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Bucket::Zero),
            1 => Ok(Bucket::One),
            other => Err(format!("invalid instance bucket {other}, expected 0 or 1")),
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_index())
    }
}

/// `instanceId = accountId:bucket:host` (spec.md §4.1 Packet Orderer, and the
/// dispatcher's per-instance disconnect timer, §4.7).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    pub account_id: AccountId,
    pub bucket: Bucket,
    pub host: Host,
}

impl StreamId {
    pub fn new(account_id: AccountId, bucket: Bucket, host: Host) -> Self {
        Self {
            account_id,
            bucket,
            host,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.account_id, self.bucket, self.host)
    }
}

impl FromStr for StreamId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let account = parts.next().ok_or("missing accountId")?;
        let bucket = parts.next().ok_or("missing bucket")?;
        let host = parts.next().ok_or("missing host")?;

        let bucket: u8 = bucket.parse().map_err(|_| "bad bucket".to_string())?;
        let bucket = Bucket::try_from(bucket)?;

        Ok(StreamId::new(account.into(), bucket, host.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_round_trips() {
        let id = StreamId::new("A".into(), Bucket::One, "h1".into());
        let s = id.to_string();
        assert_eq!(s, "A:1:h1");
        assert_eq!(s.parse::<StreamId>().unwrap(), id);
    }

    #[test]
    fn bucket_region_suffix() {
        assert_eq!(Bucket::Zero.as_region_suffix(), 'a');
        assert_eq!(Bucket::One.as_region_suffix(), 'b');
    }
}
