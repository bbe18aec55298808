//! SSTable writer: streams sorted rows into a complete SSTable file.
//!
//! [`SstBuilder`] accepts rows one at a time in strictly increasing key
//! order, cuts data blocks as they fill, and on [`finish`](SstBuilder::finish)
//! appends bloom filter, properties, metaindex, index and footer.
//!
//! Rows arrive either decoded ([`SstBuilder::add_row`]) or as the raw
//! entries of another table ([`SstBuilder::append_entry`]). The second
//! path copies the encoded body unchanged and decodes it only when the
//! header says it carries deletion markers, which the deletion histogram
//! needs.
//!
//! # Atomicity
//!
//! 1. Everything is written to `<path>.tmp`.
//! 2. The file is flushed and synced.
//! 3. `<path>.tmp` is renamed to `<path>`.
//!
//! A builder dropped before `finish` removes its temporary file, so an
//! abandoned compaction leaves nothing behind.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    mem,
    path::{Path, PathBuf},
};

use bloomfilter::Bloom;
use tracing::{trace, warn};

use crate::encoding::{self, Encode};
use crate::row::{Row, local_time};

use super::{
    BlockHandle, DeletionHistogram, MetaIndexEntry, RowEntry, SST_BLOCK_CHECKSUM_SIZE,
    SST_BLOCK_LEN_SIZE, SST_BLOOM_FILTER_FALSE_POSITIVE_RATE, SST_DATA_BLOCK_MAX_SIZE,
    SST_FOOTER_SIZE, SST_HDR_MAGIC, SST_HDR_VERSION, SSTableError, SSTableFooter, SSTableHeader,
    SSTableIndexEntry, SSTableProperties, TMP_EXTENSION, crc32,
};

// ------------------------------------------------------------------------------------------------
// BuildStats: accumulates metadata during SSTable construction
// ------------------------------------------------------------------------------------------------

struct BuildStats {
    row_count: u64,
    cell_count: u64,
    tombstone_count: u64,
    min_timestamp: i64,
    max_timestamp: i64,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    histogram: DeletionHistogram,
}

impl BuildStats {
    fn new() -> Self {
        Self {
            row_count: 0,
            cell_count: 0,
            tombstone_count: 0,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            min_key: None,
            max_key: None,
            histogram: DeletionHistogram::new(),
        }
    }

    fn track_row(&mut self, entry: &RowEntry, row: Option<&Row>) {
        self.row_count += 1;
        self.cell_count += u64::from(entry.header.cell_count);
        self.min_timestamp = self.min_timestamp.min(entry.header.min_timestamp);
        self.max_timestamp = self.max_timestamp.max(entry.header.max_timestamp);
        if self.min_key.is_none() {
            self.min_key = Some(entry.key.clone());
        }
        self.max_key = Some(entry.key.clone());

        if let Some(row) = row {
            for point in row.deletion_points() {
                self.tombstone_count += 1;
                self.histogram.update(point);
            }
        }
    }

    fn into_properties(self, level: u32) -> SSTableProperties {
        SSTableProperties {
            created_at: local_time(),
            level,
            row_count: self.row_count,
            cell_count: self.cell_count,
            tombstone_count: self.tombstone_count,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key.unwrap_or_default(),
            deletion_histogram: self.histogram,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Block I/O helpers
// ------------------------------------------------------------------------------------------------

/// Writes `[len_le][data][crc32_le]` at `offset` and returns its handle.
fn write_checksummed_block(
    writer: &mut impl Write,
    offset: &mut u64,
    data: &[u8],
) -> Result<BlockHandle, SSTableError> {
    let len = encoding::len_to_u32(data.len())?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(data)?;
    writer.write_all(&crc32(data).to_le_bytes())?;

    let size = (SST_BLOCK_LEN_SIZE + data.len() + SST_BLOCK_CHECKSUM_SIZE) as u64;
    let handle = BlockHandle {
        offset: *offset,
        size,
    };
    *offset += size;
    Ok(handle)
}

fn header_bytes() -> Result<Vec<u8>, SSTableError> {
    let mut header = SSTableHeader {
        magic: SST_HDR_MAGIC,
        version: SST_HDR_VERSION,
        header_crc: 0,
    };
    header.header_crc = crc32(&encoding::encode_to_vec(&header)?);
    Ok(encoding::encode_to_vec(&header)?)
}

fn footer_bytes(metaindex: BlockHandle, index: BlockHandle, offset: u64) -> Result<Vec<u8>, SSTableError> {
    let mut footer = SSTableFooter {
        metaindex,
        index,
        total_file_size: offset + SST_FOOTER_SIZE as u64,
        footer_crc32: 0,
    };
    footer.footer_crc32 = crc32(&encoding::encode_to_vec(&footer)?);
    let bytes = encoding::encode_to_vec(&footer)?;
    debug_assert_eq!(bytes.len(), SST_FOOTER_SIZE);
    Ok(bytes)
}

// ------------------------------------------------------------------------------------------------
// SstBuilder: public entry point
// ------------------------------------------------------------------------------------------------

/// Streaming SSTable writer.
///
/// ```rust,ignore
/// let mut builder = SstBuilder::create(&path, expected_rows, 0)?;
/// for (key, row) in rows {
///     builder.add_row(key, &row)?;
/// }
/// builder.finish()?;
/// ```
pub struct SstBuilder {
    path: PathBuf,
    tmp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    offset: u64,
    level: u32,
    bloom: Bloom<Vec<u8>>,
    stats: BuildStats,
    index: Vec<SSTableIndexEntry>,
    block: Vec<u8>,
    block_first_key: Option<Vec<u8>>,
    raised_max_timestamp: i64,
    finished: bool,
}

impl SstBuilder {
    /// Starts writing the table that will live at `path`.
    ///
    /// `expected_rows` sizes the bloom filter; `level` is recorded in the
    /// properties block.
    pub fn create(
        path: impl AsRef<Path>,
        expected_rows: usize,
        level: u32,
    ) -> Result<Self, SSTableError> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = path.with_extension(TMP_EXTENSION);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        let header = header_bytes()?;
        writer.write_all(&header)?;

        let bloom = Bloom::new_for_fp_rate(expected_rows.max(1), SST_BLOOM_FILTER_FALSE_POSITIVE_RATE)
            .map_err(|e| SSTableError::Internal(e.to_string()))?;

        Ok(Self {
            path,
            tmp_path,
            writer: Some(writer),
            offset: header.len() as u64,
            level,
            bloom,
            stats: BuildStats::new(),
            index: Vec::new(),
            block: Vec::new(),
            block_first_key: None,
            raised_max_timestamp: i64::MIN,
            finished: false,
        })
    }

    /// Appends a decoded row.
    ///
    /// # Errors
    ///
    /// [`SSTableError::Internal`] if the row is empty or `key` does not
    /// sort after the previous key.
    pub fn add_row(&mut self, key: Vec<u8>, row: &Row) -> Result<(), SSTableError> {
        if row.is_empty() {
            return Err(SSTableError::Internal("cannot write an empty row".into()));
        }
        let entry = RowEntry::from_row(key, row)?;
        self.append(&entry, Some(row))
    }

    /// Appends a row copied from another table without re-encoding it.
    pub fn append_entry(&mut self, entry: &RowEntry) -> Result<(), SSTableError> {
        if entry.has_deletions() {
            let row = entry.decode()?;
            self.append(entry, Some(&row))
        } else {
            self.append(entry, None)
        }
    }

    fn append(&mut self, entry: &RowEntry, row: Option<&Row>) -> Result<(), SSTableError> {
        if self
            .stats
            .max_key
            .as_ref()
            .is_some_and(|last| last.as_slice() >= entry.key.as_slice())
        {
            return Err(SSTableError::Internal(
                "rows must be added in strictly increasing key order".into(),
            ));
        }

        self.stats.track_row(entry, row);
        self.bloom.set(&entry.key);
        if self.block_first_key.is_none() {
            self.block_first_key = Some(entry.key.clone());
        }
        entry.encode_to(&mut self.block)?;

        if self.block.len() >= SST_DATA_BLOCK_MAX_SIZE {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<(), SSTableError> {
        let Some(separator_key) = self.block_first_key.take() else {
            return Ok(());
        };
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SSTableError::Internal("builder already finished".into()))?;
        let data = mem::take(&mut self.block);
        let handle = write_checksummed_block(writer, &mut self.offset, &data)?;
        trace!(offset = handle.offset, size = handle.size, "data block written");
        self.index.push(SSTableIndexEntry {
            separator_key,
            handle,
        });
        Ok(())
    }

    /// Ensures the recorded maximum timestamp is at least `timestamp`,
    /// even if every row carrying it was purged.
    pub fn raise_max_timestamp(&mut self, timestamp: i64) {
        self.raised_max_timestamp = self.raised_max_timestamp.max(timestamp);
    }

    /// Rows appended so far.
    pub fn row_count(&self) -> u64 {
        self.stats.row_count
    }

    /// Bytes the finished data section would occupy so far.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    /// Final path of the table.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the trailing blocks, syncs, and publishes the file.
    ///
    /// # Errors
    ///
    /// [`SSTableError::Internal`] if no row was added.
    pub fn finish(mut self) -> Result<PathBuf, SSTableError> {
        if self.stats.row_count == 0 {
            return Err(SSTableError::Internal(
                "cannot finish an SSTable without rows".into(),
            ));
        }
        self.flush_block()?;

        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| SSTableError::Internal("builder already finished".into()))?;
        let mut offset = self.offset;

        let bloom = write_checksummed_block(&mut writer, &mut offset, self.bloom.as_slice())?;

        let mut stats = mem::replace(&mut self.stats, BuildStats::new());
        stats.max_timestamp = stats.max_timestamp.max(self.raised_max_timestamp);
        let properties = stats.into_properties(self.level);
        let properties = write_checksummed_block(
            &mut writer,
            &mut offset,
            &encoding::encode_to_vec(&properties)?,
        )?;

        let mut meta = Vec::new();
        encoding::encode_vec(
            &[
                MetaIndexEntry {
                    name: super::META_BLOOM.to_string(),
                    handle: bloom,
                },
                MetaIndexEntry {
                    name: super::META_PROPERTIES.to_string(),
                    handle: properties,
                },
            ],
            &mut meta,
        )?;
        let metaindex = write_checksummed_block(&mut writer, &mut offset, &meta)?;

        let mut index_bytes = Vec::new();
        encoding::encode_vec(&self.index, &mut index_bytes)?;
        let index = write_checksummed_block(&mut writer, &mut offset, &index_bytes)?;

        writer.write_all(&footer_bytes(metaindex, index, offset)?)?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| SSTableError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;
        self.finished = true;
        trace!(path = %self.path.display(), blocks = self.index.len(), "sstable published");
        Ok(self.path.clone())
    }
}

impl Drop for SstBuilder {
    fn drop(&mut self) {
        if !self.finished
            && let Err(e) = fs::remove_file(&self.tmp_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.tmp_path.display(), %e, "failed to remove abandoned sstable");
        }
    }
}
