use std::fmt;

/// Kind of a subtree change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
    /// Cache-level notifications (initialized, connection markers) that carry no node.
    Other,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Removed => "removed",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node carried by a change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub path: String,
    pub payload: Option<Vec<u8>>,
}

/// Raw change notification as delivered by the watch subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub data: Option<NodeData>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<String>, payload: Option<Vec<u8>>) -> Self {
        Self {
            kind,
            data: Some(NodeData {
                path: path.into(),
                payload,
            }),
        }
    }

    /// An event with no node attached.
    pub fn bare(kind: ChangeKind) -> Self {
        Self { kind, data: None }
    }

    /// Path of the affected node, or `""` when the event carries none.
    pub fn path(&self) -> &str {
        self.data.as_ref().map(|d| d.path.as_str()).unwrap_or("")
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.data.as_ref().and_then(|d| d.payload.as_deref())
    }
}

/// Connectivity signal from the coordination backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connected,
    Lost,
    Reconnected,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connected => "connected",
            Self::Lost => "lost",
            Self::Reconnected => "reconnected",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_resolution() {
        let event = ChangeEvent::new(ChangeKind::Added, "/a/b", Some(vec![1]));
        assert_eq!(event.path(), "/a/b");
        assert_eq!(event.payload(), Some(&[1u8][..]));

        let bare = ChangeEvent::bare(ChangeKind::Other);
        assert_eq!(bare.path(), "");
        assert_eq!(bare.payload(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ChangeKind::Removed.to_string(), "removed");
        assert_eq!(ConnectionPhase::Reconnected.to_string(), "reconnected");
    }
}
