//! The per-uplink client request queue (§3, §4.3, §9): `Free → New →
//! Pending → Processing → Free`, with superset coalescing.

use std::time::Instant;

use thiserror::Error;

/// Default queue capacity; the spec requires "capacity ≥ 64" (§3).
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    New,
    Pending,
    Processing,
}

/// One outstanding client read request tracked by the uplink worker.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub client: u64,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
    pub submit_time: Instant,
    pub status: EntryStatus,
    /// `false` when this entry was superset-coalesced into an earlier
    /// still-outstanding entry and therefore must not generate its own
    /// upstream `GET_BLOCK` request.
    pub needs_upstream_request: bool,
}

impl QueueEntry {
    fn end(&self) -> u64 {
        self.offset + self.length as u64
    }

    fn contains(&self, other_offset: u64, other_length: u32) -> bool {
        other_offset >= self.offset && other_offset + other_length as u64 <= self.end()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("uplink queue is full ({0} entries)")]
    Full(usize),
}

/// Bounded request queue. Entries live in insertion order; reply dispatch
/// walks them in reverse so the tail can shrink once its terminal entries
/// free up, keeping queue length bounded under steady state (§4.3).
pub struct UplinkQueue {
    entries: Vec<QueueEntry>,
    capacity: usize,
}

impl UplinkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a new client request, coalescing it into an existing
    /// `New`/`Pending` superset entry if one entirely covers `[offset,
    /// offset+length)`. The new entry is always appended (its slot index
    /// is therefore strictly greater than any entry it coalesces into),
    /// which is what prevents it from starving ahead of the parent on
    /// reply dispatch.
    pub fn enqueue(
        &mut self,
        client: u64,
        handle: u64,
        offset: u64,
        length: u32,
    ) -> Result<usize, QueueError> {
        if self.entries.len() >= self.capacity {
            return Err(QueueError::Full(self.capacity));
        }

        let coalesces = self
            .entries
            .iter()
            .any(|e| matches!(e.status, EntryStatus::New | EntryStatus::Pending) && e.contains(offset, length));

        self.entries.push(QueueEntry {
            client,
            handle,
            offset,
            length,
            submit_time: Instant::now(),
            status: EntryStatus::New,
            needs_upstream_request: !coalesces,
        });

        Ok(self.entries.len() - 1)
    }

    /// Collect all `New` entries and mark them `Pending`; the caller sends
    /// an upstream request for each one with `needs_upstream_request`.
    pub fn take_new_entries(&mut self) -> Vec<QueueEntry> {
        let mut taken = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.status == EntryStatus::New {
                entry.status = EntryStatus::Pending;
                taken.push(entry.clone());
            }
        }
        taken
    }

    /// All currently `Pending` entries, for unchanged resend on a socket
    /// switch (§4.3 step 1, boundary scenario 6).
    pub fn pending_entries(&self) -> Vec<QueueEntry> {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::Pending)
            .cloned()
            .collect()
    }

    /// Dispatch a reply covering `[reply_offset, reply_offset+reply_len)`:
    /// every `Pending`/`Processing` entry whose range is entirely inside
    /// the reply is handed to `on_match` (with its answered bytes, sliced
    /// by the caller from the full reply) and then freed. Walks entries in
    /// reverse so trailing freed slots can be popped off the tail.
    pub fn dispatch_reply(
        &mut self,
        reply_offset: u64,
        reply_len: u32,
        mut on_match: impl FnMut(&QueueEntry),
    ) {
        for idx in (0..self.entries.len()).rev() {
            let entry = &self.entries[idx];
            let matches = matches!(entry.status, EntryStatus::Pending | EntryStatus::Processing)
                && entry.offset >= reply_offset
                && entry.end() <= reply_offset + reply_len as u64;

            if matches {
                on_match(entry);
            }
        }

        self.entries.retain(|e| {
            !(matches!(e.status, EntryStatus::Pending | EntryStatus::Processing)
                && e.offset >= reply_offset
                && e.end() <= reply_offset + reply_len as u64)
        });
    }

    /// Drain all entries on shutdown, returning them so the caller can
    /// fail each client with a protocol error.
    pub fn drain_all(&mut self) -> Vec<QueueEntry> {
        std::mem::take(&mut self.entries)
    }

    /// `true` iff any entry's `client` differs from `background_client` —
    /// the spare-capacity gate background replication checks before
    /// synthesizing a request for the next missing hash-block (§4.3:
    /// "no pending client requests").
    pub fn has_foreground_work(&self, background_client: u64) -> bool {
        self.entries.iter().any(|e| e.client != background_client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superset_request_coalesces_and_does_not_need_upstream_request() {
        let mut queue = UplinkQueue::new(DEFAULT_CAPACITY);
        let r1 = queue.enqueue(1, 100, 0, 65536).unwrap();
        queue.take_new_entries();
        // R1 is now Pending; R2 [4096, 8192) is entirely inside it.
        let r2 = queue.enqueue(2, 200, 4096, 4096).unwrap();

        assert!(r2 > r1);
        assert!(!queue.entries[r2].needs_upstream_request);
        assert!(queue.entries[r1].needs_upstream_request);
    }

    #[test]
    fn queue_rejects_enqueue_past_capacity() {
        let mut queue = UplinkQueue::new(1);
        queue.enqueue(1, 1, 0, 4096).unwrap();
        assert_eq!(queue.enqueue(2, 2, 4096, 4096), Err(QueueError::Full(1)));
    }

    #[test]
    fn dispatch_reply_answers_coalesced_requests_from_one_reply() {
        let mut queue = UplinkQueue::new(DEFAULT_CAPACITY);
        queue.enqueue(1, 100, 0, 65536).unwrap();
        queue.enqueue(2, 200, 4096, 4096).unwrap();
        queue.take_new_entries();

        let mut answered = Vec::new();
        queue.dispatch_reply(0, 65536, |entry| answered.push(entry.handle));

        assert_eq!(answered.len(), 2);
        assert!(answered.contains(&100));
        assert!(answered.contains(&200));
        assert!(queue.is_empty());
    }

    #[test]
    fn pending_entries_survive_unchanged_across_a_socket_switch() {
        let mut queue = UplinkQueue::new(DEFAULT_CAPACITY);
        for i in 0..5u64 {
            queue.enqueue(i, 1000 + i, i * 4096, 4096).unwrap();
        }
        queue.take_new_entries();

        let before = queue.pending_entries();
        assert_eq!(before.len(), 5);

        // A switch does not touch the queue itself — only the worker's
        // socket changes — so a second snapshot must be identical.
        let after = queue.pending_entries();
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.handle, b.handle);
            assert_eq!(a.offset, b.offset);
        }
    }

    #[test]
    fn partial_overlap_does_not_coalesce() {
        let mut queue = UplinkQueue::new(DEFAULT_CAPACITY);
        queue.enqueue(1, 100, 0, 4096).unwrap();
        queue.take_new_entries();
        let r2 = queue.enqueue(2, 200, 2048, 4096).unwrap();
        assert!(queue.entries[r2].needs_upstream_request);
    }
}
