use std::collections::BTreeSet;

use crate::{HranaError, Result};

/// Hands out the lowest free non-negative id.
#[derive(Debug, Default)]
pub(crate) struct IdAlloc {
    /// Every id below `next` is allocated unless it is in `free`.
    next: i32,
    free: BTreeSet<i32>,
}

impl IdAlloc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self) -> i32 {
        if let Some(id) = self.free.pop_first() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn free(&mut self, id: i32) -> Result<()> {
        if id < 0 || id >= self.next || !self.free.insert(id) {
            return Err(HranaError::Internal(format!(
                "freeing id {id} that is not allocated"
            )));
        }
        // Shrink the high-water mark so the free set stays small.
        while self.next > 0 && self.free.remove(&(self.next - 1)) {
            self.next -= 1;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn in_use(&self) -> usize {
        self.next as usize - self.free.len()
    }
}
