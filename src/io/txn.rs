//! Buffer/Transaction Service (§6): the write path every mutating
//! phase goes through. Reads are served by [`crate::io::engine::IoEngine`]
//! directly (via `IoReader`); this module adds the reference-counted,
//! dirty-tracking buffer cache and grouped-commit transaction on top,
//! since those only matter once a phase starts writing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::context::RepairContext;
use crate::error::RepairError;
use crate::io::aligned_buf::{alloc_aligned, IO_ALIGN};
use crate::io::engine::IoEngine;

/// A cached, reference-counted block buffer. Cloning a `Buffer` takes
/// another reference to the same backing bytes — release the clone
/// when you're done with it (§5: "buffers must be released before
/// ending a worker").
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<Mutex<BufferInner>>,
}

struct BufferInner {
    offset: u64,
    data: Vec<u8>,
    dirty: bool,
    crc_bad: bool,
}

impl Buffer {
    pub fn offset(&self) -> u64 {
        self.inner.lock().unwrap().offset
    }

    pub fn crc_bad(&self) -> bool {
        self.inner.lock().unwrap().crc_bad
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.lock().unwrap().data)
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.inner.lock().unwrap().data)
    }

    fn mark_dirty(&self) {
        self.inner.lock().unwrap().dirty = true;
    }

    fn is_dirty(&self) -> bool {
        self.inner.lock().unwrap().dirty
    }
}

/// A verifier runs over a freshly-read buffer and reports whether its
/// checksum (or other self-identity field) is intact. A verifier
/// failure does not stop the read — the caller gets the bytes back
/// with `crc_bad() == true` and decides how to proceed (§7: structural
/// corruption is logged and repaired, never silently ignored).
pub type Verifier = fn(&[u8]) -> bool;

/// Owns the buffer cache for one device. Safe to share across worker
/// threads — callers still obey the per-group locking discipline
/// described in §5 for the *contents* they read through a buffer.
pub struct BufferCache {
    cache: Mutex<HashMap<u64, Buffer>>,
}

impl BufferCache {
    pub fn new() -> Self {
        BufferCache { cache: Mutex::new(HashMap::new()) }
    }

    /// Read `length` bytes at `block` (an absolute byte offset,
    /// already block-aligned by the caller). Returns a cached buffer
    /// if present, otherwise reads through `engine`.
    pub fn read(
        &self,
        engine: &mut IoEngine,
        phase: crate::io::reader::IoPhase,
        block: u64,
        length: usize,
        verifier: Option<Verifier>,
    ) -> Result<Buffer, RepairError> {
        use crate::io::reader::IoReader;

        if let Some(buf) = self.cache.lock().unwrap().get(&block) {
            return Ok(buf.clone());
        }

        let data = engine.read_at(block, length, phase)?.to_vec();
        let crc_bad = verifier.map(|v| !v(&data)).unwrap_or(false);

        let buffer = Buffer { inner: Arc::new(Mutex::new(BufferInner { offset: block, data, dirty: false, crc_bad })) };
        self.cache.lock().unwrap().insert(block, buffer.clone());
        Ok(buffer)
    }

    pub fn mark_dirty(&self, buffer: &Buffer) {
        buffer.mark_dirty();
    }

    /// Drop the cache's reference. The caller's own `Buffer` clone(s)
    /// keep the data alive until they go out of scope too.
    pub fn release(&self, buffer: &Buffer) {
        let mut cache = self.cache.lock().unwrap();
        if let Some(cached) = cache.get(&buffer.offset()) {
            if Arc::ptr_eq(&cached.inner, &buffer.inner) && Arc::strong_count(&cached.inner) <= 2 {
                cache.remove(&buffer.offset());
            }
        }
    }

    fn dirty_snapshot(&self) -> Vec<Buffer> {
        self.cache.lock().unwrap().values().filter(|b| b.is_dirty()).cloned().collect()
    }
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A transaction groups a set of buffer/inode modifications that must
/// reach disk atomically from the repair tool's point of view: either
/// all of them are written and synced, or none are (`trans_cancel`
/// simply drops the joined buffers without clearing their dirty bit —
/// the next transaction to touch them will pick the same data back up
/// or a caller-driven reset undoes it first).
pub struct Transaction<'a> {
    ctx: &'a RepairContext,
    joined: Vec<Buffer>,
}

impl<'a> Transaction<'a> {
    /// `trans_alloc`: `reservation` is advisory only here (no on-disk
    /// free-space accounting journal in this implementation); it exists
    /// so callers can size a batch the way the original interface does.
    pub fn alloc(ctx: &'a RepairContext, _reservation: usize) -> Self {
        Transaction { ctx, joined: Vec::new() }
    }

    /// `trans_join`: bind a buffer to this transaction so it is
    /// written as part of the next commit.
    pub fn join(&mut self, buffer: Buffer) {
        self.joined.push(buffer);
    }

    /// `trans_commit`: write every joined, dirty buffer through
    /// `engine`, then fsync once. In dry-run mode this is a no-op
    /// that only clears the join list — the caller already logged a
    /// "would correct" line per §7.
    pub fn commit(mut self, engine: &mut IoEngine) -> Result<(), RepairError> {
        if self.ctx.dry_run {
            self.joined.clear();
            return Ok(());
        }
        for buffer in &self.joined {
            if !buffer.is_dirty() {
                continue;
            }
            let offset = buffer.offset();
            buffer.with_bytes(|data| {
                let padded_len = (data.len() + IO_ALIGN - 1) & !(IO_ALIGN - 1);
                if padded_len == data.len() {
                    engine.write_at(offset, data)
                } else {
                    let mut padded = alloc_aligned(padded_len);
                    padded[..data.len()].copy_from_slice(data);
                    engine.write_at(offset, &padded[..data.len()])
                }
            })?;
        }
        engine.sync()?;
        self.joined.clear();
        Ok(())
    }

    /// `trans_cancel`: discard the joined set without writing.
    pub fn cancel(mut self) {
        self.joined.clear();
    }

    /// `trans_roll`: commit what's joined so far and start a fresh
    /// transaction bound to the same inode/buffer context, for chained
    /// long operations such as directory rebuild that would otherwise
    /// overflow a single reservation.
    pub fn roll(self, engine: &mut IoEngine) -> Result<Self, RepairError> {
        let ctx = self.ctx;
        self.commit(engine)?;
        Ok(Transaction::alloc(ctx, 0))
    }
}

/// Flush every outstanding dirty buffer in `cache` through `engine`,
/// bypassing the transaction grouping. Used by the orchestrator at a
/// phase boundary to guarantee §5's "all mutations of phase N are
/// durable before phase N+1 begins".
pub fn flush_all(ctx: &RepairContext, cache: &BufferCache, engine: &mut IoEngine) -> Result<(), RepairError> {
    if ctx.dry_run {
        return Ok(());
    }
    let dirty = cache.dirty_snapshot();
    for buffer in &dirty {
        let offset = buffer.offset();
        buffer.with_bytes(|data| engine.write_at(offset, data))?;
    }
    if !dirty.is_empty() {
        engine.sync()?;
    }
    Ok(())
}
