use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::catalog::attr::CatDesc;

/// Saved enumeration position inside one directory.
#[derive(Debug, Clone)]
pub struct DirHint {
    /// Ordinal of the next entry to return.
    pub index: u32,
    pub node_hint: u32,
    /// Last entry returned; empty name means "position by index".
    pub desc: CatDesc,
    pub timestamp: DateTime<Utc>,
}

impl DirHint {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            node_hint: 0,
            desc: CatDesc::default(),
            timestamp: Utc::now(),
        }
    }
}

/// Most-recently-used list of hints for one directory.
#[derive(Debug)]
pub struct DirHintList {
    hints: VecDeque<DirHint>,
    max: usize,
}

impl DirHintList {
    pub fn new(max: usize) -> Self {
        Self {
            hints: VecDeque::new(),
            max: max.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.hints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }

    /// Detach the hint for `index`, or a fresh one if none is cached.
    pub fn take(&mut self, index: u32) -> DirHint {
        match self.hints.iter().position(|h| h.index == index) {
            Some(pos) => {
                let mut hint = self.hints.remove(pos).unwrap_or_else(|| DirHint::new(index));
                hint.timestamp = Utc::now();
                hint
            }
            None => DirHint::new(index),
        }
    }

    /// Return a hint to the front of the list, evicting the least recently used.
    pub fn put(&mut self, hint: DirHint) {
        self.hints.retain(|h| h.index != hint.index);
        while self.hints.len() >= self.max {
            if let Some(old) = self.hints.pop_back() {
                debug!("evicting directory hint index={}", old.index);
            }
        }
        self.hints.push_front(hint);
    }

    pub fn remove(&mut self, index: u32) {
        self.hints.retain(|h| h.index != index);
    }

    /// Drop hints older than `ttl`. Returns how many were dropped.
    pub fn prune_stale(&mut self, ttl: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_default();
        let before = self.hints.len();
        self.hints.retain(|h| h.timestamp >= cutoff);
        before - self.hints.len()
    }

    pub fn clear(&mut self) {
        self.hints.clear();
    }
}
