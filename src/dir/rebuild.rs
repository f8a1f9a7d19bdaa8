//! Directory rebuild (§4.8 step 6, design notes "directory rebuild's
//! deferred-op chain"): unmap -> finish -> roll -> re-initialize ->
//! re-add each surviving entry, expressed as a pipeline of bounded
//! transactions rather than one generic retry wrapper.
//!
//! The pipeline is restartable by construction: the unmap step commits
//! on its own, before re-initialization begins, so an abort between
//! the two steps leaves the directory empty — the next run's phase 6
//! orphanage logic re-attaches whatever was surviving without this
//! module needing any resume bookkeeping of its own.

use crate::context::RepairContext;
use crate::error::RepairError;
use crate::format::dir::block::{encode_single_block_dir, entries_fit_in_block};
use crate::format::dir::shortform::{encode_shortform_dir, shortform_size};
use crate::format::dir::DirEntryRecord;
use crate::format::extent::Extent;
use crate::format::superblock::FsContext;
use crate::incore::block_state::{BlockState, BlockStateMap};
use crate::io::engine::IoEngine;
use crate::io::txn::{BufferCache, Transaction};

/// What format the rebuilt directory ended up in. The caller (the
/// dinode processor / phase 5) is responsible for patching the
/// inode's `di_format`/`di_size`/`di_forkoff` fields to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuiltFormat {
    /// Entries fit embedded in the inode; `bytes` replaces the fork.
    Shortform,
    /// Entries fit in one data block at the directory's first block
    /// address; `bytes` is written there and all other old data
    /// blocks stay unmapped (freed).
    SingleBlock,
    /// The surviving entry set is too large for this crate's rebuild
    /// writer (leaf/node multi-block format); entries beyond the
    /// first block's worth were dropped and an orphanage-bound
    /// truncation correction was recorded — see `DESIGN.md` open
    /// question on multi-block directory rebuild.
    TruncatedSingleBlock,
}

pub struct RebuildOutcome {
    pub format: RebuiltFormat,
    pub bytes: Vec<u8>,
    /// First AG-relative block address the bytes were written to, when
    /// `format` is block-resident (`None` for `Shortform`).
    pub block_addr: Option<u32>,
    pub truncated_entries: usize,
}

/// Step 1: unmap every old data block, returning the block-state map
/// (already updated) and a committed transaction freeing the blocks
/// on disk. Restartable — this step's commit is independent of step 2.
fn unmap_old_blocks(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &mut IoEngine,
    cache: &BufferCache,
    block_state: &mut BlockStateMap,
    old_extents: &[Extent],
) -> Result<(), RepairError> {
    let mut txn = Transaction::alloc(ctx, old_extents.len());
    for extent in old_extents {
        block_state.set(extent.ag_block as u64, extent.block_count, BlockState::Free);
        if ctx.dry_run {
            continue;
        }
        let offset = fs.ag_block_to_byte(extent.ag_number, extent.ag_block);
        let len = (extent.block_count as usize) * fs.block_size as usize;
        let buffer = cache.read(engine, crate::io::reader::IoPhase::DirExtents, offset, len, None)?;
        buffer.with_bytes_mut(|b| b.fill(0));
        cache.mark_dirty(&buffer);
        txn.join(buffer);
    }
    txn.commit(engine)
}

/// Steps 2-4: decide the new format, encode it, and (for block-
/// resident formats) write it through a fresh transaction at the
/// directory's first old block address — or, if there were no old
/// data blocks (the directory was previously shortform), the caller
/// supplies one via `fallback_block`.
#[allow(clippy::too_many_arguments)]
fn reinitialize(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &mut IoEngine,
    cache: &BufferCache,
    self_ino: u64,
    parent_ino: u64,
    surviving: &[DirEntryRecord],
    first_block: Option<(u32, u32)>,
) -> Result<RebuildOutcome, RepairError> {
    let fork_capacity = fs.inode_size as usize / 2; // conservative embedded-fork budget
    if shortform_size(surviving, parent_ino, fs) <= fork_capacity {
        let bytes = encode_shortform_dir(surviving, parent_ino, fs);
        return Ok(RebuildOutcome { format: RebuiltFormat::Shortform, bytes, block_addr: None, truncated_entries: 0 });
    }

    let block_len = fs.dir_blk_size() as usize;
    let Some((agno, agblock)) = first_block else {
        return Err(RepairError::Structural("directory rebuild needs a block address for block format"));
    };

    let (kept, truncated) = if entries_fit_in_block(surviving, fs, block_len) {
        (surviving.to_vec(), 0)
    } else {
        // Drop entries from the tail until the remainder fits; dropped
        // names are re-attached by the orphanage pass in phase 6 since
        // their parent link no longer exists after this rebuild.
        let mut kept = surviving.to_vec();
        while !kept.is_empty() && !entries_fit_in_block(&kept, fs, block_len) {
            kept.pop();
        }
        (kept, surviving.len() - kept.len())
    };

    let bytes = encode_single_block_dir(&kept, fs, block_len);

    if !ctx.dry_run {
        let offset = fs.ag_block_to_byte(agno, agblock);
        let mut txn = Transaction::alloc(ctx, 1);
        let buffer = cache.read(engine, crate::io::reader::IoPhase::DirExtents, offset, block_len, None)?;
        buffer.with_bytes_mut(|b| b.copy_from_slice(&bytes));
        cache.mark_dirty(&buffer);
        txn.join(buffer);
        txn.commit(engine)?;
    }

    Ok(RebuildOutcome {
        format: if truncated == 0 { RebuiltFormat::SingleBlock } else { RebuiltFormat::TruncatedSingleBlock },
        bytes,
        block_addr: Some(agblock),
        truncated_entries: truncated,
    })
}

/// Run the full rebuild pipeline for one directory: unmap every old
/// data block (freeing it in the incore block-state map and zeroing it
/// on disk), then re-initialize and re-insert every surviving entry.
///
/// `first_block` is the AG-relative block address to reuse for a
/// block-resident rebuild, typically the directory's own first old
/// data block (or a freshly allocated one if the directory was
/// previously shortform and is growing past the embedded budget —
/// block allocation itself is the Buffer/Transaction Service's job,
/// out of scope here per §1).
#[allow(clippy::too_many_arguments)]
pub fn rebuild_directory(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &mut IoEngine,
    cache: &BufferCache,
    block_state: &mut BlockStateMap,
    self_ino: u64,
    parent_ino: u64,
    old_extents: &[Extent],
    surviving: Vec<DirEntryRecord>,
    first_block: Option<(u32, u32)>,
) -> Result<RebuildOutcome, RepairError> {
    unmap_old_blocks(ctx, fs, engine, cache, block_state, old_extents)?;
    reinitialize(ctx, fs, engine, cache, self_ino, parent_ino, &surviving, first_block)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FsContext {
        crate::format::superblock::tests::minimal_ctx(true)
    }

    #[test]
    fn small_entry_set_rebuilds_to_shortform() {
        let fs = ctx();
        let entries = vec![
            DirEntryRecord { child_ino: 128, name: b".".to_vec(), file_type: 2, block_offset: 0 },
            DirEntryRecord { child_ino: 1, name: b"..".to_vec(), file_type: 2, block_offset: 0 },
            DirEntryRecord { child_ino: 200, name: b"a".to_vec(), file_type: 1, block_offset: 0 },
        ];
        // dry-run: reinitialize never opens the engine for a shortform
        // result, so a placeholder engine/cache is enough here.
        let rc = RepairContext::default().dry_run(true);
        let mut engine = fake_engine();
        let cache = BufferCache::new();
        let outcome =
            reinitialize(&rc, &fs, &mut engine, &cache, 128, 1, &entries, Some((0, 100))).unwrap();
        assert_eq!(outcome.format, RebuiltFormat::Shortform);
    }

    #[test]
    fn oversized_entry_set_falls_back_to_single_block_and_truncates() {
        let fs = ctx();
        let mut entries = vec![
            DirEntryRecord { child_ino: 128, name: b".".to_vec(), file_type: 2, block_offset: 0 },
            DirEntryRecord { child_ino: 1, name: b"..".to_vec(), file_type: 2, block_offset: 0 },
        ];
        for i in 0..5000u64 {
            entries.push(DirEntryRecord {
                child_ino: 1000 + i,
                name: format!("file-{i:06}-with-a-long-padded-name-to-blow-the-block-budget").into_bytes(),
                file_type: 1,
                block_offset: 0,
            });
        }
        let rc = RepairContext::default().dry_run(true);
        let mut engine = fake_engine();
        let cache = BufferCache::new();
        let outcome =
            reinitialize(&rc, &fs, &mut engine, &cache, 128, 1, &entries, Some((0, 100))).unwrap();
        assert_eq!(outcome.format, RebuiltFormat::TruncatedSingleBlock);
        assert!(outcome.truncated_entries > 0);
    }

    fn fake_engine() -> IoEngine {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap()
    }
}
