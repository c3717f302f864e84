use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::{Error, Result};

/// Payload published for the local process under its registration path.
///
/// Built once and never mutated; the manager shares it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    instance_id: String,
    ip: String,
    port: u16,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    registered_at_ms: u64,
}

impl MemberRecord {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            ip: ip.into(),
            port,
            metadata: BTreeMap::new(),
            registered_at_ms: current_timestamp_ms(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `ip:port`, the address peers use to reach this member.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn registered_at_ms(&self) -> u64 {
        self.registered_at_ms
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Namespace under which members register, e.g. `/services/push`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationPath(String);

impl RegistrationPath {
    /// # Errors
    ///
    /// Returns `Error::InvalidPath` unless the path is absolute, has no empty
    /// segments and no trailing slash (the root `/` is allowed).
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(Error::InvalidPath(format!("'{}' is not absolute", path)));
        }
        if path.len() > 1 && path.ends_with('/') {
            return Err(Error::InvalidPath(format!("'{}' has a trailing slash", path)));
        }
        if path.len() > 1 && path[1..].split('/').any(str::is_empty) {
            return Err(Error::InvalidPath(format!("'{}' has an empty segment", path)));
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix handed to the backend when creating a sequential child.
    pub fn member_prefix(&self) -> String {
        if self.0 == "/" {
            "/".to_string()
        } else {
            format!("{}/", self.0)
        }
    }

    /// True if `path` is this namespace or lies beneath it.
    pub fn contains(&self, path: &str) -> bool {
        path == self.0 || path.starts_with(&self.member_prefix())
    }
}

impl fmt::Display for RegistrationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
