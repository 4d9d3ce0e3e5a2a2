//! Tagged identifiers for the latency service (spec.md §4.4, §3 Data Model).
//!
//! This crate is a dependency of `streaming-core`, not the other way around,
//! so it carries its own copies of the small id newtypes rather than sharing
//! `streaming-core::ids` (which would be circular). The shapes mirror that
//! module's `string_id!` macro.

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

/// Redundancy index `{0, 1}` (spec.md §3 "Instance bucket").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Bucket {
    Zero,
    One,
}

impl Bucket {
    pub fn as_index(self) -> usize {
        match self {
            Bucket::Zero => 0,
            Bucket::One => 1,
        }
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

/// `instanceId = accountId:region:bucket:host` (spec.md §4.4 Latency
/// Service — distinct from the orderer/dispatcher's `accountId:bucket:host`
/// `StreamId`, since latency additionally keys by region).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    pub account_id: AccountId,
    pub region: Region,
    pub bucket: Bucket,
    pub host: Host,
}

impl InstanceId {
    pub fn new(account_id: AccountId, region: Region, bucket: Bucket, host: Host) -> Self {
        Self {
            account_id,
            region,
            bucket,
            host,
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.account_id, self.region, self.bucket, self.host)
    }
}

impl FromStr for InstanceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(4, ':');
        let account = parts.next().ok_or("missing accountId")?;
        let region = parts.next().ok_or("missing region")?;
        let bucket = parts.next().ok_or("missing bucket")?;
        let host = parts.next().ok_or("missing host")?;

        let bucket: u8 = bucket.parse().map_err(|_| "bad bucket".to_string())?;
        let bucket = Bucket::try_from(bucket)?;

        Ok(InstanceId::new(account.into(), region.into(), bucket, host.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_round_trips() {
        let id = InstanceId::new("A".into(), "new-york".into(), Bucket::One, "h1".into());
        let s = id.to_string();
        assert_eq!(s, "A:new-york:1:h1");
        assert_eq!(s.parse::<InstanceId>().unwrap(), id);
    }
}
