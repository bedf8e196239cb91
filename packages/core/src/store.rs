//! Active job list and bounded undo stack.

use std::collections::VecDeque;

use crate::{JobId, JobRecord};

/// Ordered collection of active jobs plus a bounded stack of removed ones.
///
/// `active` is kept sorted by `seq`, so a restored record lands back at its
/// original position. The undo stack evicts its oldest entry once `capacity`
/// is exceeded.
#[derive(Debug, Clone)]
pub struct JobStore {
    active: Vec<JobRecord>,
    undo_stack: VecDeque<JobRecord>,
    capacity: usize,
    next_seq: u64,
}

impl JobStore {
    /// Create an empty store whose undo stack holds at most `capacity` jobs.
    pub fn new(capacity: usize) -> Self {
        Self {
            active: Vec::new(),
            undo_stack: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    /// Hand out the next insertion sequence number.
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Insert a record at the position given by its `seq`.
    pub fn insert(&mut self, record: JobRecord) {
        self.next_seq = self.next_seq.max(record.seq);
        let index = self.active.partition_point(|r| r.seq < record.seq);
        self.active.insert(index, record);
    }

    /// Remove a record from the active list.
    pub fn remove(&mut self, id: JobId) -> Option<JobRecord> {
        let index = self.active.iter().position(|r| r.id == id)?;
        Some(self.active.remove(index))
    }

    pub fn get(&self, id: JobId) -> Option<&JobRecord> {
        self.active.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut JobRecord> {
        self.active.iter_mut().find(|r| r.id == id)
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.get(id).is_some()
    }

    /// Active records, most recent first.
    pub fn iter_recent(&self) -> impl Iterator<Item = &JobRecord> {
        self.active.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Push a removed record onto the undo stack.
    ///
    /// Returns the evicted oldest record when the stack was full.
    pub fn push_undo(&mut self, record: JobRecord) -> Option<JobRecord> {
        let evicted = if self.undo_stack.len() >= self.capacity {
            self.undo_stack.pop_front()
        } else {
            None
        };
        self.undo_stack.push_back(record);
        evicted
    }

    /// Pop the most recently removed record and put it back in the active list.
    pub fn restore_last(&mut self) -> Option<JobRecord> {
        let record = self.undo_stack.pop_back()?;
        self.insert(record.clone());
        Some(record)
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn undo_capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a record is kept on the undo stack.
    pub fn is_restorable(&self, id: JobId) -> bool {
        self.undo_stack.iter().any(|r| r.id == id)
    }

    /// Every record the store still references, active or restorable.
    pub fn all_records(&self) -> impl Iterator<Item = &JobRecord> {
        self.active.iter().chain(self.undo_stack.iter())
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(5)
    }
}
