//! Identifiers and addressing enums

use crate::error::ValueError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Correlation id of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Where a hosted object runs
///
/// Fixed at first registration of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// Loops run as threads of the registering process
    Main,
    /// Loops run on dedicated threads
    Thread,
    /// Instance is rebuilt and driven inside a child process
    Process,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Main => "main",
            ComponentKind::Thread => "thread",
            ComponentKind::Process => "process",
        }
    }

    pub fn is_process(&self) -> bool {
        matches!(self, ComponentKind::Process)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" => Ok(ComponentKind::Main),
            "thread" => Ok(ComponentKind::Thread),
            "process" => Ok(ComponentKind::Process),
            _ => Err(ValueError::Parse {
                input: s.to_string(),
                target: "component kind",
            }),
        }
    }
}

/// One of the three inbound queues of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Ctrl,
    Poll,
    Stream,
}

impl QueueClass {
    pub const ALL: [QueueClass; 3] = [QueueClass::Ctrl, QueueClass::Poll, QueueClass::Stream];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Ctrl => "ctrl",
            QueueClass::Poll => "poll",
            QueueClass::Stream => "stream",
        }
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 32);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Process".parse::<ComponentKind>().unwrap(), ComponentKind::Process);
        assert_eq!(ComponentKind::Thread.to_string(), "thread");
        assert!("fiber".parse::<ComponentKind>().is_err());
    }
}
