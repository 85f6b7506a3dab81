//! Layered content stream: a stack of equal-length sparse streams where the
//! topmost stored range wins.

use crate::stream::{union_extents, SparseStream, StreamExtent};
use crate::util::{align_up_u64, checked_range};
use crate::{Result, VdError};

/// A read stack of sparse streams with copy-on-write semantics.
///
/// Layer 0 is the top. A read picks, per sub-range, the topmost layer whose
/// stored set covers it; bytes stored in no layer read as zero. Writes
/// always land in the top layer after [`LayeredStream::promote`] has seeded
/// the surrounding granule from the layers below.
pub struct LayeredStream {
    layers: Vec<Box<dyn SparseStream>>,
    length: u64,
    position: u64,
    promote_granularity: u64,
}

impl std::fmt::Debug for LayeredStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredStream")
            .field("layers", &self.layers.len())
            .field("length", &self.length)
            .field("position", &self.position)
            .field("promote_granularity", &self.promote_granularity)
            .finish()
    }
}

impl LayeredStream {
    /// Build a stack from top to bottom. All layers must report the same
    /// length.
    pub fn new(layers: Vec<Box<dyn SparseStream>>) -> Result<Self> {
        let length = layers
            .first()
            .ok_or(VdError::NotSupported("layered stream needs at least one layer"))?
            .len();
        if layers.iter().any(|layer| layer.len() != length) {
            return Err(VdError::Corrupt("layer length mismatch"));
        }
        Ok(Self {
            layers,
            length,
            position: 0,
            promote_granularity: 1,
        })
    }

    /// Set the copy-on-write unit. Writes promote whole granules into the
    /// top layer, the way a differencing image materializes whole blocks.
    pub fn set_promote_granularity(&mut self, granularity: u64) -> Result<()> {
        if granularity == 0 {
            return Err(VdError::NotSupported("promotion granularity must be non-zero"));
        }
        self.promote_granularity = granularity;
        Ok(())
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_mut(&mut self, index: usize) -> &mut dyn SparseStream {
        self.layers[index].as_mut()
    }

    pub fn into_layers(self) -> Vec<Box<dyn SparseStream>> {
        self.layers
    }

    /// Copy every not-yet-stored sub-range of the granule-rounded window
    /// `[offset, offset + len)` from the layers below into the top layer.
    ///
    /// After promotion the top layer stores the whole rounded window, so
    /// later reads never fall through for it. This is the differencing-disk
    /// copy-on-write step, exposed for callers that want to pre-materialize
    /// blocks without writing payload bytes.
    pub fn promote(&mut self, offset: u64, len: u64) -> Result<()> {
        self.promote_excluding(offset, len, None)
    }

    fn promote_excluding(
        &mut self,
        offset: u64,
        len: u64,
        exclude: Option<StreamExtent>,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = offset.checked_add(len).ok_or(VdError::OffsetOverflow)?;
        if end > self.length {
            return Err(VdError::OutOfBounds {
                offset,
                len: len as usize,
                capacity: self.length,
            });
        }

        let granularity = self.promote_granularity;
        let start = offset / granularity * granularity;
        let end = align_up_u64(end, granularity)?.min(self.length);

        let stored_top = self.layers[0].extents_in_range(start, end - start)?;
        let mut gaps = complement(start, end, &stored_top);
        if let Some(exclude) = exclude {
            gaps = gaps
                .into_iter()
                .flat_map(|gap| subtract(gap, exclude))
                .collect();
        }

        for gap in gaps {
            let mut staged = vec![0u8; gap.length as usize];
            self.read_stack(1, gap.start, &mut staged)?;
            self.layers[0].write_all_at(gap.start, &staged)?;
        }
        Ok(())
    }

    /// Topmost layer covering `from`, plus the end of the span over which
    /// that answer holds (bounded by `limit`).
    fn locate(&mut self, min_layer: usize, from: u64, limit: u64) -> Result<(Option<usize>, u64)> {
        let mut span_end = limit;
        for (idx, layer) in self.layers.iter_mut().enumerate().skip(min_layer) {
            let extents = layer.extents_in_range(from, span_end - from)?;
            if let Some(first) = extents.first() {
                if first.start <= from {
                    return Ok((Some(idx), span_end.min(first.end())));
                }
                // A deeper layer may cover [from, first.start), but this
                // layer takes over from first.start onward.
                span_end = span_end.min(first.start);
            }
        }
        Ok((None, span_end))
    }

    /// Fill `buf` from layers `min_layer..`, zeroing sub-ranges stored
    /// nowhere.
    fn read_stack(&mut self, min_layer: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let limit = offset + buf.len() as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let cur = offset + done as u64;
            let (winner, span_end) = self.locate(min_layer, cur, limit)?;
            let span = (span_end - cur) as usize;
            match winner {
                Some(idx) => {
                    self.layers[idx].read_exact_at(cur, &mut buf[done..done + span])?;
                }
                None => buf[done..done + span].fill(0),
            }
            done += span;
        }
        Ok(())
    }
}

impl SparseStream for LayeredStream {
    fn len(&self) -> u64 {
        self.length
    }

    fn can_write(&self) -> bool {
        self.layers[0].can_write()
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        if position > self.length {
            return Err(VdError::OutOfBounds {
                offset: position,
                len: 0,
                capacity: self.length,
            });
        }
        self.position = position;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pos = self.position;
        let n = buf.len().min(self.length.saturating_sub(pos) as usize);
        self.read_stack(0, pos, &mut buf[..n])?;
        self.position = pos + n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.can_write() {
            return Err(VdError::NotWritable);
        }
        checked_range(self.position, buf.len(), self.length)?;
        if buf.is_empty() {
            return Ok(());
        }
        let pos = self.position;
        let payload = StreamExtent::new(pos, buf.len() as u64);
        self.promote_excluding(pos, buf.len() as u64, Some(payload))?;
        self.layers[0].write_all_at(pos, buf)?;
        self.position = pos + buf.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for layer in &mut self.layers {
            layer.flush()?;
        }
        Ok(())
    }

    fn stored_extents(&mut self) -> Result<Vec<StreamExtent>> {
        let mut lists = Vec::with_capacity(self.layers.len());
        for layer in &mut self.layers {
            lists.push(layer.stored_extents()?);
        }
        Ok(union_extents(lists))
    }
}

/// Ranges of `[start, end)` not covered by the sorted extent list.
fn complement(start: u64, end: u64, stored: &[StreamExtent]) -> Vec<StreamExtent> {
    let mut gaps = Vec::new();
    let mut cursor = start;
    for extent in stored {
        if extent.start > cursor {
            gaps.push(StreamExtent::new(cursor, extent.start - cursor));
        }
        cursor = cursor.max(extent.end());
    }
    if cursor < end {
        gaps.push(StreamExtent::new(cursor, end - cursor));
    }
    gaps
}

/// `gap` minus `taken`, as zero, one, or two remaining ranges.
fn subtract(gap: StreamExtent, taken: StreamExtent) -> Vec<StreamExtent> {
    match gap.intersect(&taken) {
        None => vec![gap],
        Some(overlap) => {
            let mut out = Vec::new();
            if overlap.start > gap.start {
                out.push(StreamExtent::new(gap.start, overlap.start - gap.start));
            }
            if overlap.end() < gap.end() {
                out.push(StreamExtent::new(overlap.end(), gap.end() - overlap.end()));
            }
            out
        }
    }
}
