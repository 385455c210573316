//! Segmented packet buffers
//!
//! Packets handed to the transform engine arrive as chains of buffer
//! segments, exactly as the network stack received or built them. Header
//! fields, digests and cipher blocks may straddle a segment boundary, so all
//! access goes through offset-based helpers that walk the chain.
//!
//! ```text
//!  segment 0            segment 1                 segment 2
//! ┌──────────────────┐ ┌───────────────────────┐ ┌──────────────┐
//! │ IP hdr │ ESP hdr │ │ IV │ ciphertext ...   │ │ ... │ ICV    │
//! └──────────────────┘ └───────────────────────┘ └──────────────┘
//!          offset 0 ──────────────────────────────────────▶ len()
//! ```

use bytes::{Buf, BytesMut};

use super::{Error, Result};

/// A packet stored as a chain of byte segments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferChain {
    segments: Vec<BytesMut>,
}

impl BufferChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chain holding `data` in a single segment
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            segments: vec![BytesMut::from(data)],
        }
    }

    /// Create a chain from existing segments; empty segments are dropped
    pub fn from_segments(segments: Vec<BytesMut>) -> Self {
        Self {
            segments: segments.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// Split `data` into segments of at most `segment_len` bytes
    pub fn segmented(data: &[u8], segment_len: usize) -> Self {
        let segment_len = segment_len.max(1);
        Self {
            segments: data.chunks(segment_len).map(BytesMut::from).collect(),
        }
    }

    /// Total number of bytes in the chain
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// Whether the chain holds no data
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of segments
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Borrow the raw segments
    pub fn segments(&self) -> &[BytesMut] {
        &self.segments
    }

    /// Copy the whole chain into one contiguous vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out
    }

    /// Find the segment holding byte `offset`
    fn locate(&self, offset: usize) -> Option<(usize, usize)> {
        let mut base = 0;
        for (i, seg) in self.segments.iter().enumerate() {
            if offset < base + seg.len() {
                return Some((i, offset - base));
            }
            base += seg.len();
        }
        None
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let available = self.len();
        match offset.checked_add(len) {
            Some(end) if end <= available => Ok(()),
            _ => Err(Error::BufferTooShort {
                required: offset.saturating_add(len),
                available,
            }),
        }
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let mut done = 0;
        self.for_each_chunk(offset, buf.len(), |chunk| {
            buf[done..done + chunk.len()].copy_from_slice(chunk);
            done += chunk.len();
        })
    }

    /// Overwrite bytes starting at `offset` with `data`
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let mut done = 0;
        self.for_each_chunk_mut(offset, data.len(), |chunk| {
            let n = chunk.len();
            chunk.copy_from_slice(&data[done..done + n]);
            done += n;
        })
    }

    /// Read one byte
    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_at(offset, &mut b)?;
        Ok(b[0])
    }

    /// Read a big-endian u16
    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_at(offset, &mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    /// Read a big-endian u32
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_at(offset, &mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    /// Write one byte
    pub fn write_u8(&mut self, offset: usize, value: u8) -> Result<()> {
        self.write_at(offset, &[value])
    }

    /// Write a big-endian u16
    pub fn write_u16(&mut self, offset: usize, value: u16) -> Result<()> {
        self.write_at(offset, &value.to_be_bytes())
    }

    /// Write a big-endian u32
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_be_bytes())
    }

    /// Copy a range out of the chain
    pub fn copy_range(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_at(offset, &mut out)?;
        Ok(out)
    }

    /// Visit the bytes of `[offset, offset + len)` segment by segment
    pub fn for_each_chunk<F>(&self, offset: usize, len: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]),
    {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let (mut idx, mut pos) = self
            .locate(offset)
            .ok_or_else(|| Error::Internal("offset not in chain".into()))?;
        let mut left = len;
        while left > 0 {
            let seg = &self.segments[idx];
            let n = left.min(seg.len() - pos);
            f(&seg[pos..pos + n]);
            left -= n;
            idx += 1;
            pos = 0;
        }
        Ok(())
    }

    /// Visit the bytes of `[offset, offset + len)` mutably, segment by segment
    pub fn for_each_chunk_mut<F>(&mut self, offset: usize, len: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&mut [u8]),
    {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let (mut idx, mut pos) = self
            .locate(offset)
            .ok_or_else(|| Error::Internal("offset not in chain".into()))?;
        let mut left = len;
        while left > 0 {
            let seg = &mut self.segments[idx];
            let n = left.min(seg.len() - pos);
            f(&mut seg[pos..pos + n]);
            left -= n;
            idx += 1;
            pos = 0;
        }
        Ok(())
    }

    /// Bytes available from `offset` to the end of its segment
    pub fn contiguous_len(&self, offset: usize) -> usize {
        match self.locate(offset) {
            Some((idx, pos)) => self.segments[idx].len() - pos,
            None => 0,
        }
    }

    /// Mutable view of `[offset, offset + len)` if it lies in one segment
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let (idx, pos) = self.locate(offset)?;
        let seg = &mut self.segments[idx];
        if pos + len <= seg.len() {
            Some(&mut seg[pos..pos + len])
        } else {
            None
        }
    }

    /// Splice `data` into the chain so that it starts at `offset`
    ///
    /// The data becomes its own segment; the segment that held `offset` is
    /// split around it.
    pub fn insert(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let total = self.len();
        if offset > total {
            return Err(Error::BufferTooShort {
                required: offset,
                available: total,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        match self.locate(offset) {
            None => self.segments.push(BytesMut::from(data)),
            Some((idx, 0)) => self.segments.insert(idx, BytesMut::from(data)),
            Some((idx, pos)) => {
                let tail = self.segments[idx].split_off(pos);
                self.segments.insert(idx + 1, BytesMut::from(data));
                self.segments.insert(idx + 2, tail);
            }
        }
        Ok(())
    }

    /// Remove `len` bytes starting at `offset`
    pub fn remove(&mut self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, len)?;
        let mut left = len;
        while left > 0 {
            let (idx, pos) = self
                .locate(offset)
                .ok_or_else(|| Error::Internal("offset not in chain".into()))?;
            let seg = &mut self.segments[idx];
            let mut tail = seg.split_off(pos);
            let n = left.min(tail.len());
            tail.advance(n);
            seg.unsplit(tail);
            if seg.is_empty() {
                self.segments.remove(idx);
            }
            left -= n;
        }
        Ok(())
    }

    /// Add bytes at the front of the chain
    pub fn prepend(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.segments.insert(0, BytesMut::from(data));
        }
    }

    /// Add bytes at the end of the chain
    pub fn append(&mut self, data: &[u8]) {
        match self.segments.last_mut() {
            Some(last) => last.extend_from_slice(data),
            None => self.segments.push(BytesMut::from(data)),
        }
    }

    /// Shorten the chain to `new_len` bytes
    pub fn truncate(&mut self, new_len: usize) {
        let mut base = 0;
        let mut keep = 0;
        for seg in self.segments.iter_mut() {
            if base + seg.len() >= new_len {
                seg.truncate(new_len - base);
                keep += 1;
                break;
            }
            base += seg.len();
            keep += 1;
        }
        self.segments.truncate(keep);
        self.segments.retain(|s| !s.is_empty());
    }

    /// Sequential reader starting at `offset`
    pub fn cursor(&self, offset: usize) -> ChainCursor<'_> {
        ChainCursor {
            chain: self,
            position: offset,
        }
    }
}

/// Sequential big-endian reader over a [`BufferChain`]
#[derive(Debug, Clone)]
pub struct ChainCursor<'a> {
    chain: &'a BufferChain,
    position: usize,
}

impl<'a> ChainCursor<'a> {
    /// Current offset in the chain
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left after the current position
    pub fn remaining(&self) -> usize {
        self.chain.len().saturating_sub(self.position)
    }

    /// Advance without reading
    pub fn skip(&mut self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(Error::BufferTooShort {
                required: self.position + n,
                available: self.chain.len(),
            });
        }
        self.position += n;
        Ok(())
    }

    /// Fill `buf` and advance
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.chain.read_at(self.position, buf)?;
        self.position += buf.len();
        Ok(())
    }

    /// Read one byte and advance
    pub fn read_u8(&mut self) -> Result<u8> {
        let v = self.chain.read_u8(self.position)?;
        self.position += 1;
        Ok(v)
    }

    /// Read a big-endian u16 and advance
    pub fn read_u16(&mut self) -> Result<u16> {
        let v = self.chain.read_u16(self.position)?;
        self.position += 2;
        Ok(v)
    }

    /// Read a big-endian u32 and advance
    pub fn read_u32(&mut self) -> Result<u32> {
        let v = self.chain.read_u32(self.position)?;
        self.position += 4;
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0u8..32).collect()
    }

    #[test]
    fn test_segmented_layout() {
        let chain = BufferChain::segmented(&sample(), 5);
        assert_eq!(chain.segment_count(), 7);
        assert_eq!(chain.len(), 32);
        assert_eq!(chain.to_vec(), sample());
    }

    #[test]
    fn test_straddling_reads() {
        let chain = BufferChain::segmented(&sample(), 3);

        // u32 starting at offset 2 spans two segment boundaries
        assert_eq!(chain.read_u32(2).unwrap(), 0x0203_0405);
        assert_eq!(chain.read_u16(5).unwrap(), 0x0506);
        assert_eq!(chain.copy_range(7, 6).unwrap(), vec![7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_straddling_writes() {
        let mut chain = BufferChain::segmented(&sample(), 3);
        chain.write_u32(4, 0xdead_beef).unwrap();

        let data = chain.to_vec();
        assert_eq!(&data[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(data[3], 3);
        assert_eq!(data[8], 8);
    }

    #[test]
    fn test_out_of_range() {
        let chain = BufferChain::from_slice(&[1, 2, 3]);
        assert!(matches!(
            chain.read_u32(0),
            Err(Error::BufferTooShort {
                required: 4,
                available: 3
            })
        ));
        assert!(chain.read_u8(3).is_err());
    }

    #[test]
    fn test_insert_middle_of_segment() {
        let mut chain = BufferChain::segmented(&sample(), 8);
        chain.insert(10, &[0xaa, 0xbb]).unwrap();

        let data = chain.to_vec();
        assert_eq!(data.len(), 34);
        assert_eq!(&data[9..13], &[9, 0xaa, 0xbb, 10]);
    }

    #[test]
    fn test_insert_at_boundaries() {
        let mut chain = BufferChain::segmented(&[1, 2, 3, 4], 2);
        chain.insert(0, &[0]).unwrap();
        chain.insert(3, &[9]).unwrap();
        chain.insert(6, &[5]).unwrap();
        assert_eq!(chain.to_vec(), vec![0, 1, 2, 9, 3, 4, 5]);

        assert!(chain.insert(100, &[1]).is_err());
    }

    #[test]
    fn test_remove_across_segments() {
        let mut chain = BufferChain::segmented(&sample(), 4);
        chain.remove(2, 9).unwrap();

        let mut expected = sample();
        expected.drain(2..11);
        assert_eq!(chain.to_vec(), expected);
    }

    #[test]
    fn test_append_truncate_prepend() {
        let mut chain = BufferChain::segmented(&[1, 2, 3, 4, 5], 2);
        chain.append(&[6, 7]);
        assert_eq!(chain.len(), 7);

        chain.truncate(3);
        assert_eq!(chain.to_vec(), vec![1, 2, 3]);

        chain.prepend(&[0]);
        assert_eq!(chain.to_vec(), vec![0, 1, 2, 3]);

        chain.truncate(0);
        assert!(chain.is_empty());
        chain.append(&[8]);
        assert_eq!(chain.to_vec(), vec![8]);
    }

    #[test]
    fn test_cursor() {
        let chain = BufferChain::segmented(&sample(), 3);
        let mut cursor = chain.cursor(1);
        assert_eq!(cursor.read_u8().unwrap(), 1);
        assert_eq!(cursor.read_u16().unwrap(), 0x0203);
        cursor.skip(4).unwrap();
        assert_eq!(cursor.read_u32().unwrap(), 0x0809_0a0b);
        assert_eq!(cursor.position(), 12);
        assert_eq!(cursor.remaining(), 20);
        assert!(cursor.skip(21).is_err());
    }

    #[test]
    fn test_chunk_visitor() {
        let chain = BufferChain::segmented(&sample(), 5);
        let mut sizes = Vec::new();
        chain
            .for_each_chunk(3, 10, |c| sizes.push(c.len()))
            .unwrap();
        assert_eq!(sizes, vec![2, 5, 3]);
    }
}
