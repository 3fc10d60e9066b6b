//! Bounded pool of decode staging arenas.
//!
//! A fountain-mode decoder that spilled its chunks to disk needs a large
//! contiguous buffer when it attempts to decode: the stored chunks are
//! copied out of the mapping in one pass before being fed to the codec.
//! Those arenas are multi-megabyte, so a small fixed set of them is
//! recycled across decoders through lock-free pointer slots; when the pool
//! runs dry a fresh arena is allocated, and when it is full a returned
//! arena is simply dropped.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

const POOL_SLOTS: usize = 5;

/// Reusable staging buffer for one decode-from-disk pass.
#[derive(Debug, Default)]
pub struct DecodeArena {
    buf: Vec<u8>,
}

impl DecodeArena {
    /// A zero-filled slice of exactly `len` bytes, reusing capacity.
    pub fn bytes_mut(&mut self, len: usize) -> &mut [u8] {
        self.buf.clear();
        self.buf.resize(len, 0);
        &mut self.buf[..]
    }
}

/// Fixed-capacity arena pool shared by all decoders in the process context.
#[derive(Debug)]
pub struct CodecPool {
    slots: [AtomicPtr<DecodeArena>; POOL_SLOTS],
}

impl CodecPool {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Default::default(),
        })
    }

    /// Borrow an arena; allocates when every slot is empty.
    #[must_use]
    pub fn take(self: &Arc<Self>) -> ArenaGuard {
        for slot in &self.slots {
            let p = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                let arena = unsafe { Box::from_raw(p) };
                return ArenaGuard {
                    arena: Some(arena),
                    pool: Arc::clone(self),
                };
            }
        }
        ArenaGuard {
            arena: Some(Box::default()),
            pool: Arc::clone(self),
        }
    }

    fn put(&self, arena: Box<DecodeArena>) {
        let p = Box::into_raw(arena);
        for slot in &self.slots {
            if slot
                .compare_exchange(ptr::null_mut(), p, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
        // Pool full: let the arena go.
        drop(unsafe { Box::from_raw(p) });
    }
}

impl Drop for CodecPool {
    fn drop(&mut self) {
        for slot in &self.slots {
            let p = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

/// Scoped handle on a pooled arena; returns it on drop.
#[derive(Debug)]
pub struct ArenaGuard {
    arena: Option<Box<DecodeArena>>,
    pool: Arc<CodecPool>,
}

impl std::ops::Deref for ArenaGuard {
    type Target = DecodeArena;

    fn deref(&self) -> &DecodeArena {
        self.arena.as_ref().expect("arena present until drop")
    }
}

impl std::ops::DerefMut for ArenaGuard {
    fn deref_mut(&mut self) -> &mut DecodeArena {
        self.arena.as_mut().expect("arena present until drop")
    }
}

impl Drop for ArenaGuard {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.take() {
            self.pool.put(arena);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_returns_to_pool_and_keeps_capacity() {
        let pool = CodecPool::new();
        {
            let mut guard = pool.take();
            let bytes = guard.bytes_mut(4096);
            bytes[0] = 7;
        }
        // The same arena comes back, zeroed on request.
        let mut guard = pool.take();
        let bytes = guard.bytes_mut(4096);
        assert_eq!(bytes[0], 0);
    }

    #[test]
    fn exhausted_pool_falls_back_to_allocation() {
        let pool = CodecPool::new();
        let guards: Vec<_> = (0..POOL_SLOTS + 2).map(|_| pool.take()).collect();
        assert_eq!(guards.len(), POOL_SLOTS + 2);
        drop(guards);
        // All slots refilled; surplus arenas were dropped.
        let again: Vec<_> = (0..POOL_SLOTS).map(|_| pool.take()).collect();
        assert_eq!(again.len(), POOL_SLOTS);
    }
}
