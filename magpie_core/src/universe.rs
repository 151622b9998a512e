//! The global coverage universe and the admission decision.
//!
//! All shared mutable admission state lives behind one lock: the grow-only
//! edge set and the corpus-id counter. Callers only see the atomic
//! [`CoverageUniverse::admit`] operation, so two workers racing on files with
//! overlapping edges can never both claim the same edge as new, and ids stay
//! dense among admitted entries.

use parking_lot::Mutex;
use std::collections::HashSet;

/// Result of offering a candidate edge set to the universe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The candidate contributed at least one previously unseen edge and was
    /// assigned the next corpus id.
    Admitted { id: u64, new_edges: usize },
    /// Every edge was already known; no id was consumed.
    Rejected,
}

struct UniverseInner {
    edges: HashSet<u64>,
    next_id: u64,
}

pub struct CoverageUniverse {
    inner: Mutex<UniverseInner>,
}

impl Default for CoverageUniverse {
    fn default() -> Self {
        Self::new()
    }
}

impl CoverageUniverse {
    /// Fresh universe; corpus ids start at 1.
    pub fn new() -> Self {
        Self::resume(std::iter::empty(), 1)
    }

    /// Universe restored from a checkpoint.
    pub fn resume(edges: impl IntoIterator<Item = u64>, next_id: u64) -> Self {
        Self {
            inner: Mutex::new(UniverseInner {
                edges: edges.into_iter().collect(),
                next_id: next_id.max(1),
            }),
        }
    }

    /// Check-and-insert for the whole candidate set in one critical section.
    ///
    /// Inserts every unseen edge, and if any insertion took, increments the
    /// corpus-id counter under the same lock and hands the id back for file
    /// naming.
    pub fn admit(&self, candidate: &HashSet<u64>) -> Admission {
        let mut inner = self.inner.lock();
        let mut new_edges = 0;
        for &edge in candidate {
            if inner.edges.insert(edge) {
                new_edges += 1;
            }
        }
        if new_edges == 0 {
            return Admission::Rejected;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        Admission::Admitted { id, new_edges }
    }

    pub fn edge_count(&self) -> usize {
        self.inner.lock().edges.len()
    }

    pub fn next_id(&self) -> u64 {
        self.inner.lock().next_id
    }

    /// Sorted edge list plus the id counter, for checkpointing. Sorting makes
    /// the serialized form deterministic.
    pub fn snapshot(&self) -> (Vec<u64>, u64) {
        let inner = self.inner.lock();
        let mut edges: Vec<u64> = inner.edges.iter().copied().collect();
        edges.sort_unstable();
        (edges, inner.next_id)
    }
}
