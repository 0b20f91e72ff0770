//! Fixed pool of reusable frame buffers.
//!
//! The pool pre-allocates every buffer a capture session will ever use and
//! tracks them by identity. Buffers circulate between the capture source's
//! free list, the pending slot, and the processing loop; they are recycled,
//! never freed individually, until the session ends.
//!
//! Identity-based lookup is a correctness requirement, not an optimization:
//! two frames of a static scene can be bit-for-bit identical, so a
//! content-keyed table would wrongly coalesce them. Every buffer carries a
//! [`BufferId`] assigned at allocation and the pool keeps an id-keyed table.

use std::collections::HashMap;

/// Stable identity of a pooled frame buffer.
///
/// Ids are unique across the lifetime of a [`FramePool`], including across
/// `reset()`; a buffer from a previous session can never alias one from the
/// current session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// One pre-allocated frame buffer.
///
/// Deliberately not `Clone`: a buffer is a resource with identity, and the
/// type system enforcing single ownership is what makes "recycled exactly
/// once" hold. Content moves with the value; the pool only remembers the id.
pub struct FrameBuffer {
    id: BufferId,
    data: Box<[u8]>,
}

impl FrameBuffer {
    fn new(id: BufferId, len: usize) -> Self {
        Self {
            id,
            data: vec![0u8; len].into_boxed_slice(),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view for the capture source to write one frame into.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Identity table over all buffers handed to the current capture session.
pub struct FramePool {
    /// id -> allocation size. Populated by `acquire_set`, emptied by `reset`.
    entries: HashMap<BufferId, usize>,
    next_id: u64,
}

impl FramePool {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    /// Pre-allocate `count` buffers of `frame_bytes` each and register their
    /// identities. The returned buffers are meant to prime the capture
    /// source's free list.
    pub fn acquire_set(&mut self, frame_bytes: usize, count: usize) -> Vec<FrameBuffer> {
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            let id = BufferId(self.next_id);
            self.next_id += 1;
            self.entries.insert(id, frame_bytes);
            buffers.push(FrameBuffer::new(id, frame_bytes));
        }
        buffers
    }

    /// Whether `id` belongs to a buffer handed out for the current session.
    pub fn is_registered(&self, id: BufferId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Snapshot of the registered identities, for lock-free membership
    /// checks on the delivery path while the session runs.
    pub fn registered_ids(&self) -> std::collections::HashSet<BufferId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all buffer registrations. Called when the session stops; buffers
    /// still in flight become unmapped and any late delivery of one is
    /// skipped by the sink.
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}
