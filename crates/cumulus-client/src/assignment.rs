use std::collections::BTreeMap;

/// Sticky step-to-cluster assignment for one job.
///
/// A step bound explicitly always lands on its cluster. Every other step
/// takes the next cluster of the round-robin pool the first time it is
/// asked about and keeps it for the rest of the job, retries included.
#[derive(Debug, Clone)]
pub struct AssignmentTable {
    explicit: BTreeMap<String, usize>,
    pool: Vec<usize>,
    cursor: usize,
    assigned: BTreeMap<String, usize>,
}

impl AssignmentTable {
    /// `pool` must not be empty.
    pub fn new(explicit: BTreeMap<String, usize>, pool: Vec<usize>) -> Self {
        Self {
            explicit,
            pool,
            cursor: 0,
            assigned: BTreeMap::new(),
        }
    }

    pub fn assign(&mut self, step: &str) -> usize {
        if let Some(&index) = self.assigned.get(step) {
            return index;
        }
        let index = match self.explicit.get(step) {
            Some(&index) => index,
            None => {
                let index = self.pool[self.cursor % self.pool.len()];
                self.cursor += 1;
                index
            }
        };
        self.assigned.insert(step.to_string(), index);
        index
    }

    pub fn get(&self, step: &str) -> Option<usize> {
        self.assigned.get(step).copied()
    }

    pub fn assignments(&self) -> &BTreeMap<String, usize> {
        &self.assigned
    }
}
