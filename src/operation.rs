//! Bookkeeping for background operations.

use std::{collections::BTreeMap, fmt, time::Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Load,
    Index,
    Search,
    Download,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Load => "load",
            OperationKind::Index => "index",
            OperationKind::Search => "search",
            OperationKind::Download => "download",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one operation, e.g. `index-3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId {
    pub kind: OperationKind,
    pub seq: u64,
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.seq)
    }
}

impl Serialize for OperationId {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Why an operation was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("{active} is already running")]
    Busy { active: OperationId },
    #[error("{active} must finish first")]
    Conflict { active: OperationId },
    #[error("no model is loaded")]
    NoModel,
    #[error("shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct ActiveOperation {
    pub id: OperationId,
    pub cancel: CancellationToken,
    pub started: Instant,
}

/// The active operations, at most one per kind.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    active: BTreeMap<OperationKind, ActiveOperation>,
    next_seq: u64,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new operation of `kind`, or reject it as busy.
    pub fn admit(&mut self, kind: OperationKind) -> Result<ActiveOperation, Rejected> {
        if let Some(op) = self.active.get(&kind) {
            return Err(Rejected::Busy { active: op.id });
        }
        self.next_seq += 1;
        let op = ActiveOperation {
            id: OperationId {
                kind,
                seq: self.next_seq,
            },
            cancel: CancellationToken::new(),
            started: Instant::now(),
        };
        self.active.insert(kind, op.clone());
        Ok(op)
    }

    /// Remove `id` if it is still the active operation of its kind.
    pub fn finish(&mut self, id: OperationId) -> Option<ActiveOperation> {
        match self.active.get(&id.kind) {
            Some(op) if op.id == id => self.active.remove(&id.kind),
            _ => None,
        }
    }

    pub fn get(&self, kind: OperationKind) -> Option<&ActiveOperation> {
        self.active.get(&kind)
    }

    pub fn is_active(&self, kind: OperationKind) -> bool {
        self.active.contains_key(&kind)
    }

    /// Request cancellation of the active operation of `kind`.
    pub fn cancel(&self, kind: OperationKind) -> Option<OperationId> {
        let op = self.active.get(&kind)?;
        op.cancel.cancel();
        Some(op.id)
    }

    pub fn cancel_all(&self) -> Vec<OperationId> {
        self.active
            .values()
            .map(|op| {
                op.cancel.cancel();
                op.id
            })
            .collect()
    }

    pub fn ids(&self) -> Vec<OperationId> {
        self.active.values().map(|op| op.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_operation_of_a_kind_is_busy() {
        let mut registry = OperationRegistry::new();
        let first = registry.admit(OperationKind::Index).unwrap();
        assert_eq!(first.id.to_string(), "index-1");

        assert_eq!(
            registry.admit(OperationKind::Index).unwrap_err(),
            Rejected::Busy { active: first.id }
        );
        let search = registry.admit(OperationKind::Search).unwrap();
        assert_eq!(search.id.seq, 2);
    }

    #[test]
    fn finish_ignores_stale_ids() {
        let mut registry = OperationRegistry::new();
        let first = registry.admit(OperationKind::Search).unwrap();
        registry.finish(first.id).unwrap();
        let second = registry.admit(OperationKind::Search).unwrap();

        assert!(registry.finish(first.id).is_none());
        assert!(registry.is_active(OperationKind::Search));
        assert_eq!(registry.finish(second.id).unwrap().id, second.id);
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_all_trips_every_token() {
        let mut registry = OperationRegistry::new();
        let load = registry.admit(OperationKind::Load).unwrap();
        let download = registry.admit(OperationKind::Download).unwrap();

        let cancelled = registry.cancel_all();
        assert_eq!(cancelled.len(), 2);
        assert!(load.cancel.is_cancelled());
        assert!(download.cancel.is_cancelled());
        // Cancellation does not deregister.
        assert!(registry.is_active(OperationKind::Load));
    }

    #[test]
    fn ids_serialize_as_strings() {
        let id = OperationId {
            kind: OperationKind::Download,
            seq: 7,
        };
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"download-7\"");
    }
}
