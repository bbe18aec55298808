//! Bounded histogram of deletion times.
//!
//! Each SSTable records when its deletion markers were written so the
//! size-tiered strategy can estimate, without reading data blocks, what
//! fraction of a table a compaction at a given `gc_before` could drop.
//! The histogram keeps at most [`MAX_BINS`] bins; when a new point would
//! exceed that, the two closest bins are merged into their weighted mean.

use crate::encoding::{Decode, Encode, EncodingError, decode_at, len_to_u32};

/// Upper bound on the number of bins kept per table.
pub const MAX_BINS: usize = 100;

/// Streaming histogram of `(point, count)` bins ordered by point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionHistogram {
    bins: Vec<(u32, u64)>,
}

impl DeletionHistogram {
    /// Empty histogram.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one deletion marker at `point`.
    pub fn update(&mut self, point: u32) {
        self.add(point, 1);
    }

    /// Folds another histogram into this one.
    pub fn merge(&mut self, other: &DeletionHistogram) {
        for &(point, count) in &other.bins {
            self.add(point, count);
        }
    }

    fn add(&mut self, point: u32, count: u64) {
        match self.bins.binary_search_by_key(&point, |&(p, _)| p) {
            Ok(i) => self.bins[i].1 += count,
            Err(i) => {
                self.bins.insert(i, (point, count));
                if self.bins.len() > MAX_BINS {
                    self.shrink();
                }
            }
        }
    }

    fn shrink(&mut self) {
        let Some(i) = (0..self.bins.len() - 1).min_by_key(|&i| self.bins[i + 1].0 - self.bins[i].0)
        else {
            return;
        };
        let (p1, c1) = self.bins[i];
        let (p2, c2) = self.bins.remove(i + 1);
        let total = c1 + c2;
        let weighted = (u128::from(p1) * u128::from(c1) + u128::from(p2) * u128::from(c2))
            / u128::from(total.max(1));
        self.bins[i] = (u32::try_from(weighted).unwrap_or(p2), total);
    }

    /// Number of recorded markers.
    pub fn total(&self) -> u64 {
        self.bins.iter().map(|&(_, c)| c).sum()
    }

    /// Markers whose point lies strictly before `bound`.
    pub fn count_before(&self, bound: u32) -> u64 {
        self.bins
            .iter()
            .take_while(|&&(p, _)| p < bound)
            .map(|&(_, c)| c)
            .sum()
    }

    /// Bins in ascending point order.
    pub fn bins(&self) -> &[(u32, u64)] {
        &self.bins
    }
}

impl Encode for DeletionHistogram {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.bins.len())?.encode_to(buf)?;
        for (point, count) in &self.bins {
            point.encode_to(buf)?;
            count.encode_to(buf)?;
        }
        Ok(())
    }
}

impl Decode for DeletionHistogram {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let len: u32 = decode_at(buf, &mut off)?;
        if len as usize > MAX_BINS {
            return Err(EncodingError::LengthOverflow(format!(
                "histogram has {len} bins, limit is {MAX_BINS}"
            )));
        }
        let mut bins = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let point: u32 = decode_at(buf, &mut off)?;
            let count: u64 = decode_at(buf, &mut off)?;
            bins.push((point, count));
        }
        if bins.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(EncodingError::Invalid("histogram bins out of order".into()));
        }
        Ok((Self { bins }, off))
    }
}
