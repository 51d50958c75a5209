use std::collections::HashSet;

/// Append-only record of every pool index chosen for oracle labeling.
///
/// Owned by the orchestrator for the whole run and lent `&mut` to the
/// selection policy. Iteration yields indices in the order they were
/// selected. Entries are never evicted.
#[derive(Debug, Clone, Default)]
pub struct SelectionLedger {
    order: Vec<usize>,
    members: HashSet<usize>,
}

impl SelectionLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `index` was selected in any earlier round.
    pub fn contains(&self, index: usize) -> bool {
        self.members.contains(&index)
    }

    /// Record `index`. Returns `false` if it was already present.
    pub fn insert(&mut self, index: usize) -> bool {
        if self.members.insert(index) {
            self.order.push(index);
            true
        } else {
            false
        }
    }

    /// Number of distinct indices selected so far.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Indices in selection order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.order.iter().copied()
    }

    /// Indices in selection order as a slice.
    pub fn as_slice(&self) -> &[usize] {
        &self.order
    }
}

impl Extend<usize> for SelectionLedger {
    fn extend<I: IntoIterator<Item = usize>>(&mut self, iter: I) {
        for index in iter {
            self.insert(index);
        }
    }
}
