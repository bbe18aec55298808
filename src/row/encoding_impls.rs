//! Encode / Decode implementations for the row model.
//!
//! ```text
//! Row   := [deletion: Option<DeletionInfo>][cells: Vec<Cell>]
//! Cell  := [name][timestamp i64][tag u8][kind fields]
//!          tag 0 Live      -> [value]
//!          tag 1 Tombstone -> [local_deletion_time u32]
//!          tag 2 Expiring  -> [ttl u32][local_expiration_time u32][value]
//! ```
//!
//! An encoded row body is what data blocks store after the row key, and
//! what the echoed-row path copies between tables unchanged.

use crate::encoding::{self, Decode, Encode, EncodingError, decode_at};

use super::{Cell, CellKind, DeletionInfo, Row};

const CELL_TAG_LIVE: u8 = 0;
const CELL_TAG_TOMBSTONE: u8 = 1;
const CELL_TAG_EXPIRING: u8 = 2;

impl Encode for DeletionInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.marked_for_delete_at.encode_to(buf)?;
        self.local_deletion_time.encode_to(buf)
    }
}

impl Decode for DeletionInfo {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let marked_for_delete_at = decode_at(buf, &mut off)?;
        let local_deletion_time = decode_at(buf, &mut off)?;
        Ok((
            Self {
                marked_for_delete_at,
                local_deletion_time,
            },
            off,
        ))
    }
}

impl Encode for Cell {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.timestamp.encode_to(buf)?;
        match self.kind {
            CellKind::Live => {
                CELL_TAG_LIVE.encode_to(buf)?;
                self.value.encode_to(buf)
            }
            CellKind::Tombstone {
                local_deletion_time,
            } => {
                CELL_TAG_TOMBSTONE.encode_to(buf)?;
                local_deletion_time.encode_to(buf)
            }
            CellKind::Expiring {
                ttl,
                local_expiration_time,
            } => {
                CELL_TAG_EXPIRING.encode_to(buf)?;
                ttl.encode_to(buf)?;
                local_expiration_time.encode_to(buf)?;
                self.value.encode_to(buf)
            }
        }
    }
}

impl Decode for Cell {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let name: Vec<u8> = decode_at(buf, &mut off)?;
        let timestamp: i64 = decode_at(buf, &mut off)?;
        let tag: u8 = decode_at(buf, &mut off)?;
        let (kind, value) = match tag {
            CELL_TAG_LIVE => (CellKind::Live, decode_at(buf, &mut off)?),
            CELL_TAG_TOMBSTONE => (
                CellKind::Tombstone {
                    local_deletion_time: decode_at(buf, &mut off)?,
                },
                Vec::new(),
            ),
            CELL_TAG_EXPIRING => {
                let ttl = decode_at(buf, &mut off)?;
                let local_expiration_time = decode_at(buf, &mut off)?;
                (
                    CellKind::Expiring {
                        ttl,
                        local_expiration_time,
                    },
                    decode_at(buf, &mut off)?,
                )
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: u32::from(other),
                    type_name: "Cell",
                });
            }
        };
        Ok((
            Self {
                name,
                value,
                timestamp,
                kind,
            },
            off,
        ))
    }
}

impl Encode for Row {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.deletion.encode_to(buf)?;
        encoding::encode_vec(&self.cells, buf)
    }
}

impl Decode for Row {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let deletion = decode_at::<Option<DeletionInfo>>(buf, &mut off)?;
        let (cells, n) = encoding::decode_vec::<Cell>(&buf[off..])?;
        off += n;
        if cells.windows(2).any(|w| w[0].name >= w[1].name) {
            return Err(EncodingError::Invalid(
                "row cells are not strictly ordered by name".into(),
            ));
        }
        Ok((Self { deletion, cells }, off))
    }
}
