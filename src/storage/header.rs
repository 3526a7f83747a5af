//! File header codec.
//!
//! Two header copies live on pages 0 and 1 and alternate on each data-file
//! flush; at open, the copy with the greater transaction id (and a valid
//! magic/version) wins. The layout is packed little-endian:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 8 | magic_marker |
//! | 8 | 4 | version |
//! | 12 | 40 | journal_info |
//! | 52 | 8 | transaction_id |
//! | 60 | 8 | last_page_number |
//! | 68 | 40 | free_space header |
//! | 108 | 24 | root tree header |

use crate::common::TxId;
use crate::error::{DbError, Result};
use crate::tree::TreeState;

pub const MAGIC_MARKER: [u8; 8] = *b"COWDB\x00\x00\x01";
pub const FORMAT_VERSION: u32 = 1;
pub const FILE_HEADER_SIZE: usize = 132;

/// Journal bookkeeping persisted with each data-file flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalInfo {
    /// Most recent journal file number recorded at flush time.
    pub recent_log: i64,
    /// Number of journal files still carrying unapplied transactions.
    pub log_count: i64,
    /// Flush counter; its low bit selects the header slot to write next.
    pub data_flush_counter: i64,
    /// Journal file the applier last synced from.
    pub last_synced_log: i64,
    /// Page position inside `last_synced_log` the applier reached.
    pub last_synced_log_page: i64,
}

impl JournalInfo {
    pub fn write_into(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.recent_log.to_le_bytes());
        buf[8..16].copy_from_slice(&self.log_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_flush_counter.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_synced_log.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_synced_log_page.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> JournalInfo {
        JournalInfo {
            recent_log: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            log_count: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            data_flush_counter: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            last_synced_log: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
            last_synced_log_page: i64::from_le_bytes(buf[32..40].try_into().unwrap()),
        }
    }
}

/// On-disk location and state of the two free-space buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeSpaceInfo {
    pub first_buffer_page: i64,
    pub buffer_pages: i64,
    pub tracked_pages: i64,
    /// Which of the two buffers holds the current bits (0 or 1).
    pub current_buffer: i64,
    pub reserved: i64,
}

impl FreeSpaceInfo {
    pub fn write_into(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.first_buffer_page.to_le_bytes());
        buf[8..16].copy_from_slice(&self.buffer_pages.to_le_bytes());
        buf[16..24].copy_from_slice(&self.tracked_pages.to_le_bytes());
        buf[24..32].copy_from_slice(&self.current_buffer.to_le_bytes());
        buf[32..40].copy_from_slice(&self.reserved.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> FreeSpaceInfo {
        FreeSpaceInfo {
            first_buffer_page: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            buffer_pages: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            tracked_pages: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            current_buffer: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
            reserved: i64::from_le_bytes(buf[32..40].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileHeader {
    pub journal: JournalInfo,
    pub transaction_id: TxId,
    pub last_page_number: u64,
    pub free_space: FreeSpaceInfo,
    pub root: TreeState,
}

impl FileHeader {
    /// Serializes the header into the front of a page-sized buffer.
    pub fn write_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= FILE_HEADER_SIZE);
        buf[0..8].copy_from_slice(&MAGIC_MARKER);
        buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        self.journal.write_into(&mut buf[12..52]);
        buf[52..60].copy_from_slice(&self.transaction_id.to_le_bytes());
        buf[60..68].copy_from_slice(&self.last_page_number.to_le_bytes());
        self.free_space.write_into(&mut buf[68..108]);
        self.root.write_into(&mut buf[108..132]);
    }

    /// Parses and validates one header copy.
    pub fn read_from(buf: &[u8]) -> Result<FileHeader> {
        if buf.len() < FILE_HEADER_SIZE {
            return Err(DbError::InvalidFormat("file too small for a header page".into()));
        }
        if buf[0..8] != MAGIC_MARKER {
            return Err(DbError::InvalidFormat("magic marker mismatch".into()));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(DbError::InvalidFormat(format!(
                "unsupported format version {version}"
            )));
        }
        Ok(FileHeader {
            journal: JournalInfo::read_from(&buf[12..52]),
            transaction_id: u64::from_le_bytes(buf[52..60].try_into().unwrap()),
            last_page_number: u64::from_le_bytes(buf[60..68].try_into().unwrap()),
            free_space: FreeSpaceInfo::read_from(&buf[68..108]),
            root: TreeState::read_from(&buf[108..132]),
        })
    }

    /// Picks the current header out of the two on-disk copies: the valid one
    /// with the greater transaction id.
    pub fn choose(first: Result<FileHeader>, second: Result<FileHeader>) -> Result<FileHeader> {
        match (first, second) {
            (Ok(a), Ok(b)) => Ok(if b.transaction_id > a.transaction_id { b } else { a }),
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(a), Err(_)) => Err(a),
        }
    }
}
