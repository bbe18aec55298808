//! # SSTables
//!
//! An SSTable is an immutable, memory-mapped file holding the rows of one
//! column family in ascending row-key order. SSTables are produced by
//! memtable flushes and by compactions, and retired once a compaction has
//! published their replacement.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! ...
//! [BLOOM_FILTER_LEN_LE][BLOOM_FILTER_BYTES][BLOOM_FILTER_CRC32_LE]
//! [PROPERTIES_LEN_LE][PROPERTIES_BYTES][PROPERTIES_CRC32_LE]
//! [METAINDEX_LEN_LE][METAINDEX_BYTES][METAINDEX_CRC32_LE]
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]
//! [FOOTER_BYTES]
//! ```
//!
//! - **Header**: magic, format version, CRC32.
//! - **Data blocks**: concatenated row entries
//!   `[key][RowHeader][row body bytes]`. The row body is the encoded
//!   [`Row`](crate::row::Row); the header summarises it so compaction can
//!   copy rows without decoding them.
//! - **Bloom filter**: row keys.
//! - **Properties**: key range, timestamp range, level, counts, and a
//!   histogram of deletion times.
//! - **Metaindex**: named handles to the bloom and properties blocks.
//! - **Index**: first key of each data block plus its handle.
//! - **Footer**: metaindex/index handles, total size, CRC32.
//!
//! Every block is checksummed. Header, footer and metadata blocks are
//! verified at [`SSTable::open`]; data blocks are verified when read, so
//! corruption surfaces as [`SSTableError::ChecksumMismatch`] from the
//! scanner or lookup that meets it.
//!
//! # Lifecycle
//!
//! An `SSTable` is shared as `Arc<SSTable>` between the live table set,
//! in-flight compactions and readers. Retiring a table only marks it
//! obsolete; the file is removed when the last handle is dropped.
//! A table whose data failed to read during compaction is marked
//! *suspect* and is never selected for compaction again.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod encoding_impls;
pub mod histogram;
pub mod iterator;


// ------------------------------------------------------------------------------------------------
// Re-exports
// ------------------------------------------------------------------------------------------------

pub use builder::SstBuilder;
pub use histogram::DeletionHistogram;
pub use iterator::{BlockIterator, RowEntry, RowHeader, SSTableScanner};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fmt,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{self, EncodingError};
use crate::row::Row;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const SST_HDR_MAGIC: [u8; 4] = *b"STR1";
const SST_HDR_VERSION: u32 = 1;
const SST_BLOOM_FILTER_FALSE_POSITIVE_RATE: f64 = 0.01;
const SST_DATA_BLOCK_MAX_SIZE: usize = 4096;
const SST_FOOTER_SIZE: usize = 44;
const SST_HDR_SIZE: usize = 12;
const SST_BLOCK_LEN_SIZE: usize = 4;
const SST_BLOCK_CHECKSUM_SIZE: usize = 4;

const META_BLOOM: &str = "filter.bloom";
const META_PROPERTIES: &str = "meta.properties";

/// File extension of a finished SSTable.
pub const SST_EXTENSION: &str = "sst";

/// File extension of an SSTable still being written.
pub const TMP_EXTENSION: &str = "tmp";

/// Path of the SSTable with `generation` inside `dir`.
pub fn sstable_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{generation:06}.{SST_EXTENSION}"))
}

/// Parses the generation out of an SSTable file name.
pub fn parse_generation(path: &Path) -> Option<u64> {
    if path.extension()? != SST_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, build).
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Structural problem with the file or a misuse of the builder.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A block's stored CRC32 does not match its contents.
    #[error("Checksum mismatch")]
    ChecksumMismatch,
}

impl SSTableError {
    /// Whether the error indicates damaged file contents rather than an
    /// environmental failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SSTableError::ChecksumMismatch | SSTableError::Encoding(_) | SSTableError::Internal(_)
        )
    }
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// SSTable file header.
pub(crate) struct SSTableHeader {
    pub(crate) magic: [u8; 4],
    pub(crate) version: u32,
    /// CRC32 of the header with this field zeroed.
    pub(crate) header_crc: u32,
}

/// Table-level metadata stored in the properties block.
#[derive(Debug, Clone, PartialEq)]
pub struct SSTableProperties {
    /// Wall-clock second the table was written.
    pub created_at: u32,

    /// Leveled-compaction level; flushes write level 0.
    pub level: u32,

    /// Number of rows.
    pub row_count: u64,

    /// Number of cells across all rows.
    pub cell_count: u64,

    /// Number of deletion markers (tombstones, expiring cells, row deletions).
    pub tombstone_count: u64,

    /// Lowest cell or row-deletion timestamp.
    pub min_timestamp: i64,

    /// Highest cell or row-deletion timestamp. Compaction outputs record at
    /// least the highest value among their inputs.
    pub max_timestamp: i64,

    /// First row key.
    pub min_key: Vec<u8>,

    /// Last row key.
    pub max_key: Vec<u8>,

    /// When the deletion markers were written.
    pub deletion_histogram: DeletionHistogram,
}

/// Index entry pointing to a data block.
pub(crate) struct SSTableIndexEntry {
    /// First row key stored in the block.
    pub(crate) separator_key: Vec<u8>,
    pub(crate) handle: BlockHandle,
}

/// SSTable footer, stored at the very end of the file.
pub(crate) struct SSTableFooter {
    pub(crate) metaindex: BlockHandle,
    pub(crate) index: BlockHandle,
    pub(crate) total_file_size: u64,
    /// CRC32 of the footer with this field zeroed.
    pub(crate) footer_crc32: u32,
}

/// Location of a checksummed block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockHandle {
    pub(crate) offset: u64,
    /// Size including length prefix and checksum.
    pub(crate) size: u64,
}

/// Named entry of the metaindex block.
#[derive(Debug)]
pub(crate) struct MetaIndexEntry {
    pub(crate) name: String,
    pub(crate) handle: BlockHandle,
}

// ------------------------------------------------------------------------------------------------
// SSTable: immutable reader
// ------------------------------------------------------------------------------------------------

/// A memory-mapped, immutable SSTable.
pub struct SSTable {
    generation: u64,
    path: PathBuf,
    mmap: Mmap,
    bloom: Bloom<Vec<u8>>,
    properties: SSTableProperties,
    pub(crate) index: Vec<SSTableIndexEntry>,
    footer: SSTableFooter,
    suspect: AtomicBool,
    obsolete: AtomicBool,
}

impl fmt::Debug for SSTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SSTable")
            .field("generation", &self.generation)
            .field("level", &self.properties.level)
            .field("size", &self.file_size())
            .field("rows", &self.properties.row_count)
            .field("suspect", &self.is_suspect())
            .finish_non_exhaustive()
    }
}

impl SSTable {
    /// Opens an SSTable, verifying header, footer and metadata blocks.
    ///
    /// Data blocks are verified lazily when read.
    ///
    /// # Errors
    ///
    /// - [`SSTableError::ChecksumMismatch`] if a verified block is damaged.
    /// - [`SSTableError::Internal`] for a truncated file, wrong magic or
    ///   version, or missing metadata.
    pub fn open(path: impl AsRef<Path>, generation: u64) -> Result<Self, SSTableError> {
        let path = path.as_ref();
        let file = File::open(path)?;

        // SAFETY: SSTable files are written once through a temporary path and
        // never modified after the rename that publishes them.
        let mmap = unsafe { Mmap::map(&file)? };

        let file_len = mmap.len();
        if file_len < SST_HDR_SIZE + SST_FOOTER_SIZE {
            return Err(SSTableError::Internal("File too small".into()));
        }

        let (mut header, _) =
            encoding::decode_from_slice::<SSTableHeader>(&mmap[..SST_HDR_SIZE])?;
        let stored = header.header_crc;
        header.header_crc = 0;
        if stored != crc32(&encoding::encode_to_vec(&header)?) {
            return Err(SSTableError::ChecksumMismatch);
        }
        if header.magic != SST_HDR_MAGIC {
            return Err(SSTableError::Internal("SSTable header magic mismatch".into()));
        }
        if header.version != SST_HDR_VERSION {
            return Err(SSTableError::Internal(
                "SSTable header version mismatch".into(),
            ));
        }

        let footer_start = file_len - SST_FOOTER_SIZE;
        let (mut footer, _) = encoding::decode_from_slice::<SSTableFooter>(&mmap[footer_start..])?;
        let stored = footer.footer_crc32;
        footer.footer_crc32 = 0;
        if stored != crc32(&encoding::encode_to_vec(&footer)?) {
            return Err(SSTableError::ChecksumMismatch);
        }
        footer.footer_crc32 = stored;
        if footer.total_file_size != file_len as u64 {
            return Err(SSTableError::Internal(format!(
                "footer records {} bytes, file has {file_len}",
                footer.total_file_size
            )));
        }

        let metaindex = read_block_bytes(&mmap, &footer.metaindex)?;
        let (meta_entries, _) = encoding::decode_vec::<MetaIndexEntry>(metaindex)?;

        let mut bloom_handle = None;
        let mut properties_handle = None;
        for entry in meta_entries {
            match entry.name.as_str() {
                META_BLOOM => bloom_handle = Some(entry.handle),
                META_PROPERTIES => properties_handle = Some(entry.handle),
                other => {
                    return Err(SSTableError::Internal(format!(
                        "unexpected metaindex entry {other:?}"
                    )));
                }
            }
        }

        let bloom_handle =
            bloom_handle.ok_or_else(|| SSTableError::Internal("SSTable missing bloom".into()))?;
        let bloom = Bloom::from_slice(read_block_bytes(&mmap, &bloom_handle)?)
            .map_err(|e| SSTableError::Internal(e.to_string()))?;

        let properties_handle = properties_handle
            .ok_or_else(|| SSTableError::Internal("SSTable missing properties".into()))?;
        let (properties, _) = encoding::decode_from_slice::<SSTableProperties>(read_block_bytes(
            &mmap,
            &properties_handle,
        )?)?;

        let (index, _) =
            encoding::decode_vec::<SSTableIndexEntry>(read_block_bytes(&mmap, &footer.index)?)?;

        debug!(
            generation,
            level = properties.level,
            rows = properties.row_count,
            size = file_len,
            "sstable opened"
        );

        Ok(Self {
            generation,
            path: path.to_path_buf(),
            mmap,
            bloom,
            properties,
            index,
            footer,
            suspect: AtomicBool::new(false),
            obsolete: AtomicBool::new(false),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Metadata
    // --------------------------------------------------------------------------------------------

    /// Generation number, unique within the family.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// On-disk size in bytes.
    pub fn file_size(&self) -> u64 {
        self.footer.total_file_size
    }

    /// Table-level metadata.
    pub fn properties(&self) -> &SSTableProperties {
        &self.properties
    }

    /// Leveled-compaction level.
    pub fn level(&self) -> u32 {
        self.properties.level
    }

    /// First row key.
    pub fn min_key(&self) -> &[u8] {
        &self.properties.min_key
    }

    /// Last row key.
    pub fn max_key(&self) -> &[u8] {
        &self.properties.max_key
    }

    /// Lowest timestamp stored.
    pub fn min_timestamp(&self) -> i64 {
        self.properties.min_timestamp
    }

    /// Highest timestamp stored.
    pub fn max_timestamp(&self) -> i64 {
        self.properties.max_timestamp
    }

    /// Whether the key ranges of `self` and `other` intersect.
    pub fn overlaps(&self, other: &SSTable) -> bool {
        self.overlaps_range(other.min_key(), other.max_key())
    }

    /// Whether `[min, max]` intersects this table's key range.
    pub fn overlaps_range(&self, min: &[u8], max: &[u8]) -> bool {
        self.min_key() <= max && min <= self.max_key()
    }

    /// Whether `key` lies in the key range and passes the bloom filter.
    ///
    /// `false` is definitive; `true` means "maybe".
    pub fn may_contain(&self, key: &[u8]) -> bool {
        key >= self.min_key() && key <= self.max_key() && self.bloom.check(&key.to_vec())
    }

    /// Estimated fraction of this table's cells a compaction could drop
    /// at `gc_before`.
    pub fn droppable_tombstone_ratio(&self, gc_before: u32) -> f64 {
        let droppable = self.properties.deletion_histogram.count_before(gc_before);
        let total = self
            .properties
            .cell_count
            .max(self.properties.tombstone_count)
            .max(1);
        droppable as f64 / total as f64
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle flags
    // --------------------------------------------------------------------------------------------

    /// Excludes the table from future compaction candidates.
    pub fn mark_suspect(&self) {
        if !self.suspect.swap(true, Ordering::AcqRel) {
            warn!(generation = self.generation, path = %self.path.display(), "sstable marked suspect");
        }
    }

    /// Whether a read of this table has failed during compaction.
    pub fn is_suspect(&self) -> bool {
        self.suspect.load(Ordering::Acquire)
    }

    /// Schedules the file for deletion once the last handle is dropped.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Whether the table has been retired from the live set.
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Looks up the row stored for `key` in this table alone.
    pub fn get(&self, key: &[u8]) -> Result<Option<Row>, SSTableError> {
        if !self.may_contain(key) || self.index.is_empty() {
            return Ok(None);
        }

        let entry = &self.index[self.find_block_for_key(key)];
        let block = self.read_block(&entry.handle)?;
        let mut iter = BlockIterator::new(block);
        while let Some(item) = iter.next_entry() {
            let item = item?;
            match item.key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return item.decode().map(Some),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Full scan over the table in key order.
    ///
    /// The scanner owns a handle on the table and yields
    /// `Result<RowEntry, SSTableError>`; after the first error it is
    /// exhausted.
    pub fn scanner(self: &Arc<Self>) -> SSTableScanner<Arc<SSTable>> {
        SSTableScanner::new(Arc::clone(self))
    }

    /// Scan over the rows whose key is `>= start`.
    pub fn scanner_from(
        self: &Arc<Self>,
        start: &[u8],
    ) -> Result<SSTableScanner<Arc<SSTable>>, SSTableError> {
        SSTableScanner::starting_at(Arc::clone(self), start)
    }

    /// Reads and verifies a data block.
    pub(crate) fn read_block(&self, handle: &BlockHandle) -> Result<&[u8], SSTableError> {
        read_block_bytes(&self.mmap, handle)
    }

    /// Index of the block whose first key is the greatest one `<= key`.
    pub(crate) fn find_block_for_key(&self, key: &[u8]) -> usize {
        match self
            .index
            .binary_search_by(|entry| entry.separator_key.as_slice().cmp(key))
        {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }
}

impl Drop for SSTable {
    fn drop(&mut self) {
        if self.is_obsolete() {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!(generation = self.generation, "obsolete sstable removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(generation = self.generation, %e, "failed to remove obsolete sstable")
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Block helpers
// ------------------------------------------------------------------------------------------------

pub(crate) fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Returns the verified contents of a `[len][bytes][crc32]` block.
pub(crate) fn read_block_bytes<'a>(
    mmap: &'a [u8],
    handle: &BlockHandle,
) -> Result<&'a [u8], SSTableError> {
    let start = usize::try_from(handle.offset)
        .map_err(|_| SSTableError::Internal("block offset exceeds addressable range".into()))?;
    let size = usize::try_from(handle.size)
        .map_err(|_| SSTableError::Internal("block size exceeds addressable range".into()))?;

    let frame = start
        .checked_add(size)
        .and_then(|end| mmap.get(start..end))
        .ok_or_else(|| SSTableError::Internal("Block out of range".into()))?;
    if frame.len() < SST_BLOCK_LEN_SIZE + SST_BLOCK_CHECKSUM_SIZE {
        return Err(SSTableError::Internal("Block frame too short".into()));
    }

    let (len_bytes, rest) = frame.split_at(SST_BLOCK_LEN_SIZE);
    let content_len = u32::from_le_bytes(
        len_bytes
            .try_into()
            .map_err(|_| SSTableError::Internal("Short block length".into()))?,
    ) as usize;
    if content_len + SST_BLOCK_CHECKSUM_SIZE != rest.len() {
        return Err(SSTableError::ChecksumMismatch);
    }

    let (content, checksum_bytes) = rest.split_at(content_len);
    let stored = u32::from_le_bytes(
        checksum_bytes
            .try_into()
            .map_err(|_| SSTableError::Internal("Short checksum".into()))?,
    );
    if crc32(content) != stored {
        return Err(SSTableError::ChecksumMismatch);
    }
    Ok(content)
}
