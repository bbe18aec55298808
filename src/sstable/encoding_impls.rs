//! Encode / Decode implementations for SSTable on-disk structures.
//!
//! The types themselves live in `super`; row entries and their headers
//! are encoded in [`super::iterator`].

use crate::encoding::{self, Decode, Encode, EncodingError};

use super::{
    BlockHandle, DeletionHistogram, MetaIndexEntry, SSTableFooter, SSTableHeader,
    SSTableIndexEntry, SSTableProperties,
};

// ------------------------------------------------------------------------------------------------
// BlockHandle
// ------------------------------------------------------------------------------------------------

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let offset: u64 = encoding::decode_at(buf, &mut off)?;
        let size: u64 = encoding::decode_at(buf, &mut off)?;
        Ok((Self { offset, size }, off))
    }
}

// ------------------------------------------------------------------------------------------------
// SSTableHeader
// ------------------------------------------------------------------------------------------------

impl Encode for SSTableHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.header_crc.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SSTableHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let magic: [u8; 4] = encoding::decode_at(buf, &mut off)?;
        let version: u32 = encoding::decode_at(buf, &mut off)?;
        let header_crc: u32 = encoding::decode_at(buf, &mut off)?;
        Ok((
            Self {
                magic,
                version,
                header_crc,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// SSTableProperties
// ------------------------------------------------------------------------------------------------

impl Encode for SSTableProperties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.created_at.encode_to(buf)?;
        self.level.encode_to(buf)?;
        self.row_count.encode_to(buf)?;
        self.cell_count.encode_to(buf)?;
        self.tombstone_count.encode_to(buf)?;
        self.min_timestamp.encode_to(buf)?;
        self.max_timestamp.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.deletion_histogram.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SSTableProperties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let created_at = encoding::decode_at(buf, &mut off)?;
        let level = encoding::decode_at(buf, &mut off)?;
        let row_count = encoding::decode_at(buf, &mut off)?;
        let cell_count = encoding::decode_at(buf, &mut off)?;
        let tombstone_count = encoding::decode_at(buf, &mut off)?;
        let min_timestamp = encoding::decode_at(buf, &mut off)?;
        let max_timestamp = encoding::decode_at(buf, &mut off)?;
        let min_key = encoding::decode_at(buf, &mut off)?;
        let max_key = encoding::decode_at(buf, &mut off)?;
        let deletion_histogram: DeletionHistogram = encoding::decode_at(buf, &mut off)?;
        Ok((
            Self {
                created_at,
                level,
                row_count,
                cell_count,
                tombstone_count,
                min_timestamp,
                max_timestamp,
                min_key,
                max_key,
                deletion_histogram,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// SSTableIndexEntry
// ------------------------------------------------------------------------------------------------

impl Encode for SSTableIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.separator_key.encode_to(buf)?;
        self.handle.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SSTableIndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let separator_key: Vec<u8> = encoding::decode_at(buf, &mut off)?;
        let handle: BlockHandle = encoding::decode_at(buf, &mut off)?;
        Ok((
            Self {
                separator_key,
                handle,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// MetaIndexEntry
// ------------------------------------------------------------------------------------------------

impl Encode for MetaIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.handle.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for MetaIndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let name: String = encoding::decode_at(buf, &mut off)?;
        let handle: BlockHandle = encoding::decode_at(buf, &mut off)?;
        Ok((Self { name, handle }, off))
    }
}

// ------------------------------------------------------------------------------------------------
// SSTableFooter
// ------------------------------------------------------------------------------------------------

impl Encode for SSTableFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.metaindex.encode_to(buf)?;
        self.index.encode_to(buf)?;
        self.total_file_size.encode_to(buf)?;
        self.footer_crc32.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SSTableFooter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let metaindex: BlockHandle = encoding::decode_at(buf, &mut off)?;
        let index: BlockHandle = encoding::decode_at(buf, &mut off)?;
        let total_file_size: u64 = encoding::decode_at(buf, &mut off)?;
        let footer_crc32: u32 = encoding::decode_at(buf, &mut off)?;
        Ok((
            Self {
                metaindex,
                index,
                total_file_size,
                footer_crc32,
            },
            off,
        ))
    }
}
