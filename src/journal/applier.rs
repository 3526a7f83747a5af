//! Journal application: the background flush that copies committed journal
//! pages into the data file and publishes a fresh file header.
//!
//! The applier never advances past the oldest active transaction; pages
//! belonging to transactions that a still-live reader anchors on stay in
//! the journal. The file-header write at the end is what allows journal
//! files to be retired: everything up to `last_synced_log` is durably in
//! the data file.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::common::PageNumber;
use crate::env::EnvCore;
use crate::error::Result;
use crate::journal::file::JournalFile;
use crate::journal::{TransactionHeader, TX_COMMIT};
use crate::storage::header::{FileHeader, JournalInfo};

/// Applies every committed transaction older than the active-transaction
/// barrier to the data file. Returns whether anything was flushed.
pub(crate) fn apply(core: &EnvCore) -> Result<bool> {
    // One applier at a time: the background thread and explicit flush calls
    // must not interleave header writes.
    let _applying = core.applier_lock.lock();
    let barrier = core.oldest_active_barrier();
    let files = core.journal.files_snapshot();
    let (last_synced_log, last_synced_page, mut flush_counter) = {
        let meta = core.meta.read();
        (
            meta.journal.last_synced_log,
            meta.journal.last_synced_log_page,
            meta.journal.data_flush_counter,
        )
    };

    // Union the translation tables of applicable transactions; the newest
    // mapping for a page wins because transactions are visited in order.
    let mut pages_to_write: BTreeMap<PageNumber, (Arc<JournalFile>, u64)> = BTreeMap::new();
    let mut staged: Vec<(PageNumber, Arc<JournalFile>, u64)> = Vec::new();
    let mut applied: Option<TransactionHeader> = None;
    let mut sync_point: Option<(i64, i64)> = None;

    'files: for jf in files.iter() {
        if (jf.number() as i64) < last_synced_log {
            continue;
        }
        let mut pos: u64 = if (jf.number() as i64) == last_synced_log {
            (last_synced_page + 1).max(0) as u64
        } else {
            0
        };
        while pos < jf.write_page() {
            let buf = jf.read_page_at(pos)?;
            let Some(hdr) = TransactionHeader::read_from(&buf) else {
                break 'files;
            };
            if hdr.txid >= barrier {
                break 'files;
            }
            let n = (hdr.page_count + hdr.overflow_page_count) as u64;
            for i in 0..n {
                let image = jf.read_page_at(pos + 1 + i)?;
                let logical = u32::from_le_bytes(image[0..4].try_into().unwrap());
                staged.push((logical, jf.clone(), pos + 1 + i));
            }
            if hdr.marker & TX_COMMIT != 0 {
                for (logical, file, offset) in staged.drain(..) {
                    pages_to_write.insert(logical, (file, offset));
                }
                sync_point = Some((jf.number() as i64, (pos + n) as i64));
                applied = Some(hdr);
            }
            pos += 1 + n;
        }
    }

    let Some(applied) = applied else {
        return Ok(false);
    };
    let (sync_file, sync_page) = sync_point.expect("sync point set with applied header");

    // Targets ascending; make sure the data file backs the largest one.
    if let Some((&max_target, _)) = pages_to_write.iter().next_back() {
        core.pager.allocate_more_pages(max_target as u64 + 1)?;
    }
    for (target, (jf, offset)) in &pages_to_write {
        let bytes = jf.read_page_at(*offset)?;
        core.pager.write_raw(*target, &bytes)?;
    }
    core.pager.sync()?;
    debug!(
        pages = pages_to_write.len(),
        txid = applied.txid,
        "journal pages applied to data file"
    );

    // Pages freed by transactions behind the barrier are now reclaimable.
    core.release_pending_free(barrier);
    let free_space = core.flush_free_space()?;

    flush_counter += 1;
    let journal_info = JournalInfo {
        recent_log: core.journal.recent_number() as i64,
        log_count: files.iter().filter(|f| (f.number() as i64) >= sync_file).count() as i64,
        data_flush_counter: flush_counter,
        last_synced_log: sync_file,
        last_synced_log_page: sync_page,
    };

    // The double-buffered header: slot = flush counter parity. Root tree
    // state and free-space state each land in their own slot of the header.
    let header = FileHeader {
        journal: journal_info,
        transaction_id: applied.txid,
        last_page_number: applied.last_page_number,
        free_space,
        root: applied.root,
    };
    let mut buf = core.pager.temp_page();
    header.write_into(&mut buf);
    let slot = (flush_counter & 1) as PageNumber;
    core.pager.write_raw(slot, &buf)?;
    core.pager.sync()?;

    {
        let mut meta = core.meta.write();
        meta.journal = journal_info;
    }
    // Only after the header landed may fully-applied journal files go away;
    // before that point recovery still needs them.
    core.journal.retire_files_before(sync_file as u64);
    info!(txid = applied.txid, header_slot = slot, "data-file flush complete");
    Ok(true)
}
