use std::env;
use std::fmt;
use std::str::FromStr;

use crate::Error;

const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_CONNECTION_QUEUE_CAPACITY: usize = 64;

/// What `unregister_app` does when the registered node is already gone.
///
/// The dominant cause is benign: the session expired and the backend removed
/// the ephemeral node on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingNodePolicy {
    /// Treat a missing node as a successful removal.
    #[default]
    Ignore,

    /// Surface a missing node as `Error::NoNode`.
    Report,
}

impl MissingNodePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Report => "report",
        }
    }
}

impl fmt::Display for MissingNodePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MissingNodePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "report" => Ok(Self::Report),
            other => Err(Error::Config(format!(
                "unknown missing node policy '{}' (expected 'ignore' or 'report')",
                other
            ))),
        }
    }
}

/// Tunables for a [`RegistrationManager`](crate::RegistrationManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationConfig {
    pub missing_node_policy: MissingNodePolicy,
    /// Bound of the queue between backend watch callbacks and the dispatch task.
    pub event_queue_capacity: usize,
    /// Bound of the queue between backend connection callbacks and the logger task.
    pub connection_queue_capacity: usize,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            missing_node_policy: MissingNodePolicy::default(),
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            connection_queue_capacity: DEFAULT_CONNECTION_QUEUE_CAPACITY,
        }
    }
}

impl RegistrationConfig {
    /// Read overrides from the environment, falling back to defaults.
    ///
    /// - `REGISTRY_MISSING_NODE`: `ignore` or `report`
    /// - `REGISTRY_EVENT_QUEUE_CAPACITY`: positive integer
    /// - `REGISTRY_CONNECTION_QUEUE_CAPACITY`: positive integer
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Ok(policy) = env::var("REGISTRY_MISSING_NODE") {
            config.missing_node_policy = policy.parse()?;
        }
        if let Ok(raw) = env::var("REGISTRY_EVENT_QUEUE_CAPACITY") {
            config.event_queue_capacity = parse_capacity("REGISTRY_EVENT_QUEUE_CAPACITY", &raw)?;
        }
        if let Ok(raw) = env::var("REGISTRY_CONNECTION_QUEUE_CAPACITY") {
            config.connection_queue_capacity =
                parse_capacity("REGISTRY_CONNECTION_QUEUE_CAPACITY", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_missing_node_policy(mut self, policy: MissingNodePolicy) -> Self {
        self.missing_node_policy = policy;
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub fn with_connection_queue_capacity(mut self, capacity: usize) -> Self {
        self.connection_queue_capacity = capacity;
        self
    }

    /// # Errors
    ///
    /// Returns `Error::Config` if a queue capacity is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.event_queue_capacity == 0 {
            return Err(Error::Config("event_queue_capacity must be > 0".into()));
        }
        if self.connection_queue_capacity == 0 {
            return Err(Error::Config("connection_queue_capacity must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_capacity(name: &str, raw: &str) -> Result<usize, Error> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| Error::Config(format!("{} must be a positive integer: {}", name, e)))
}
