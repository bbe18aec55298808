//! SSTable iterators: block-level and whole-table scan.
//!
//! - [`BlockIterator`] decodes the row entries of one data block.
//! - [`SSTableScanner`] walks every data block of a table in key order.
//!
//! # Row entries
//!
//! ```text
//! [KEY (len-prefixed)][RowHeader][ROW BODY (len-prefixed)]
//! ```
//!
//! The [`RowHeader`] summarises the body (timestamp bounds, cell count,
//! whether any deletion marker is present) so compaction can decide to
//! copy a row byte-for-byte without decoding it.
//!
//! Both iterators yield `Result`s. A checksum or decode failure is
//! reported once and then the iterator is exhausted; callers that need to
//! react to corruption (compaction) see it instead of a silently short
//! stream.

use std::ops::Deref;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::row::Row;

use super::{SSTable, SSTableError};

const ROW_FLAG_HAS_DELETIONS: u8 = 0b0000_0001;

// ------------------------------------------------------------------------------------------------
// Row entry
// ------------------------------------------------------------------------------------------------

/// Fixed-size summary stored in front of every row body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowHeader {
    flags: u8,
    /// Lowest timestamp in the row.
    pub min_timestamp: i64,
    /// Highest timestamp in the row.
    pub max_timestamp: i64,
    /// Number of cells in the row.
    pub cell_count: u32,
}

impl RowHeader {
    /// Summarises `row`.
    pub(crate) fn for_row(row: &Row) -> Result<Self, EncodingError> {
        Ok(Self {
            flags: if row.has_deletions() {
                ROW_FLAG_HAS_DELETIONS
            } else {
                0
            },
            min_timestamp: row.min_timestamp().unwrap_or(i64::MAX),
            max_timestamp: row.max_timestamp().unwrap_or(i64::MIN),
            cell_count: encoding::len_to_u32(row.cells.len())?,
        })
    }

    /// Whether the row carries any deletion marker.
    pub fn has_deletions(&self) -> bool {
        self.flags & ROW_FLAG_HAS_DELETIONS != 0
    }
}

impl Encode for RowHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.flags.encode_to(buf)?;
        self.min_timestamp.encode_to(buf)?;
        self.max_timestamp.encode_to(buf)?;
        self.cell_count.encode_to(buf)
    }
}

impl Decode for RowHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let flags: u8 = encoding::decode_at(buf, &mut off)?;
        if flags & !ROW_FLAG_HAS_DELETIONS != 0 {
            return Err(EncodingError::InvalidTag {
                tag: u32::from(flags),
                type_name: "RowHeader::flags",
            });
        }
        let min_timestamp = encoding::decode_at(buf, &mut off)?;
        let max_timestamp = encoding::decode_at(buf, &mut off)?;
        let cell_count = encoding::decode_at(buf, &mut off)?;
        Ok((
            Self {
                flags,
                min_timestamp,
                max_timestamp,
                cell_count,
            },
            off,
        ))
    }
}

/// One row as stored in a data block, body still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowEntry {
    /// Row key.
    pub key: Vec<u8>,
    /// Summary of the body.
    pub header: RowHeader,
    /// Encoded [`Row`].
    pub body: Vec<u8>,
}

impl RowEntry {
    /// Encodes `row` under `key`.
    pub(crate) fn from_row(key: Vec<u8>, row: &Row) -> Result<Self, EncodingError> {
        Ok(Self {
            key,
            header: RowHeader::for_row(row)?,
            body: encoding::encode_to_vec(row)?,
        })
    }

    /// Decodes the row body.
    pub fn decode(&self) -> Result<Row, SSTableError> {
        let (row, n) = encoding::decode_from_slice::<Row>(&self.body)?;
        if n != self.body.len() {
            return Err(SSTableError::Internal(format!(
                "row body has {} trailing bytes",
                self.body.len() - n
            )));
        }
        Ok(row)
    }

    /// Whether the row carries any deletion marker.
    pub fn has_deletions(&self) -> bool {
        self.header.has_deletions()
    }
}

impl Encode for RowEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.header.encode_to(buf)?;
        self.body.encode_to(buf)
    }
}

impl Decode for RowEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let key = encoding::decode_at(buf, &mut off)?;
        let header = encoding::decode_at(buf, &mut off)?;
        let body = encoding::decode_at(buf, &mut off)?;
        Ok((Self { key, header, body }, off))
    }
}

// ------------------------------------------------------------------------------------------------
// Block Iterator
// ------------------------------------------------------------------------------------------------

/// Iterator over the row entries of a single, already verified data block.
pub struct BlockIterator {
    data: Vec<u8>,
    cursor: usize,
}

impl BlockIterator {
    /// Wraps the contents of one data block.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            cursor: 0,
        }
    }

    /// Skips entries whose key is below `key`.
    ///
    /// Stops early on a decode error so the next call to
    /// [`next_entry`](Self::next_entry) reports it.
    pub fn seek_to(&mut self, key: &[u8]) {
        self.cursor = 0;
        while self.cursor < self.data.len() {
            let mut probe = self.cursor;
            match encoding::decode_at::<Vec<u8>>(&self.data, &mut probe) {
                Ok(k) if k.as_slice() >= key => return,
                Ok(_) => match encoding::decode_from_slice::<RowEntry>(&self.data[self.cursor..]) {
                    Ok((_, n)) => self.cursor += n,
                    Err(_) => return,
                },
                Err(_) => return,
            }
        }
    }

    /// Decodes the next entry.
    pub fn next_entry(&mut self) -> Option<Result<RowEntry, SSTableError>> {
        if self.cursor >= self.data.len() {
            return None;
        }
        match encoding::decode_from_slice::<RowEntry>(&self.data[self.cursor..]) {
            Ok((entry, n)) => {
                self.cursor += n;
                Some(Ok(entry))
            }
            Err(e) => {
                self.cursor = self.data.len();
                Some(Err(e.into()))
            }
        }
    }
}

impl Iterator for BlockIterator {
    type Item = Result<RowEntry, SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
    }
}

// ------------------------------------------------------------------------------------------------
// SSTable Scanner
// ------------------------------------------------------------------------------------------------

/// Forward scan over the rows of one SSTable, in key order.
///
/// Generic over the handle type so it can borrow (`&SSTable`) or share
/// ownership (`Arc<SSTable>`) with the live set.
///
/// Besides per-block checksums, the scanner verifies that keys strictly
/// increase across the whole table.
pub struct SSTableScanner<S: Deref<Target = SSTable>> {
    sstable: S,
    next_block: usize,
    block: Option<BlockIterator>,
    last_key: Option<Vec<u8>>,
    done: bool,
}

impl<S: Deref<Target = SSTable>> SSTableScanner<S> {
    /// Scans the whole table.
    pub fn new(sstable: S) -> Self {
        Self {
            sstable,
            next_block: 0,
            block: None,
            last_key: None,
            done: false,
        }
    }

    /// Scans rows whose key is `>= start`.
    pub fn starting_at(sstable: S, start: &[u8]) -> Result<Self, SSTableError> {
        let first = sstable.find_block_for_key(start);
        let mut scanner = Self::new(sstable);
        scanner.next_block = first;
        if scanner.load_next_block()?
            && let Some(block) = scanner.block.as_mut()
        {
            block.seek_to(start);
        }
        Ok(scanner)
    }

    /// The table being scanned.
    pub fn sstable(&self) -> &SSTable {
        &self.sstable
    }

    fn load_next_block(&mut self) -> Result<bool, SSTableError> {
        let Some(entry) = self.sstable.index.get(self.next_block) else {
            self.block = None;
            return Ok(false);
        };
        let bytes = self.sstable.read_block(&entry.handle)?;
        self.block = Some(BlockIterator::new(bytes));
        self.next_block += 1;
        Ok(true)
    }

    fn advance(&mut self) -> Option<Result<RowEntry, SSTableError>> {
        loop {
            if let Some(block) = self.block.as_mut()
                && let Some(item) = block.next_entry()
            {
                return Some(item);
            }
            match self.load_next_block() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl<S: Deref<Target = SSTable>> Iterator for SSTableScanner<S> {
    type Item = Result<RowEntry, SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match self.advance() {
            Some(Ok(entry)) => {
                if self
                    .last_key
                    .as_ref()
                    .is_some_and(|last| last.as_slice() >= entry.key.as_slice())
                {
                    Err(SSTableError::Internal(format!(
                        "sstable {} keys out of order",
                        self.sstable.generation()
                    )))
                } else {
                    self.last_key = Some(entry.key.clone());
                    Ok(entry)
                }
            }
            Some(Err(e)) => Err(e),
            None => {
                self.done = true;
                return None;
            }
        };
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}
