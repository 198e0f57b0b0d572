use crate::error::{Error, Result};
use crate::tag::{Tag, TagOrder};

/// Read cursor over a byte slice. All reads are little-endian.
///
/// A cursor may be a window into a larger buffer; `base` keeps reported
/// offsets absolute.
#[derive(Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
}

/// A block header as seen on disk: raw tag bytes plus the declared content size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub raw_tag: [u8; 4],
    pub size: u32,
}

impl Header {
    pub const LEN: usize = 8;

    pub fn tag(&self, order: TagOrder) -> Tag {
        Tag::from_disk(self.raw_tag, order)
    }

    pub fn is(&self, tag: Tag, order: TagOrder) -> bool {
        self.raw_tag == tag.to_disk(order)
    }
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            base: 0,
        }
    }

    /// Position relative to this cursor's window.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Absolute offset in the original buffer.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.pos += n;
        Ok(())
    }

    /// Split off the next `n` bytes as an independent bounded cursor and
    /// advance past them.
    pub fn take(&mut self, n: usize) -> Result<Cursor<'a>> {
        self.ensure(n)?;
        let sub = Cursor {
            data: &self.data[self.pos..self.pos + n],
            pos: 0,
            base: self.offset(),
        };
        self.pos += n;
        Ok(sub)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Everything from the current position to the end of the window.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        slice
    }

    /// Look at the next block header without consuming it.
    pub fn peek_header(&self) -> Option<Header> {
        let bytes = self.data.get(self.pos..self.pos + Header::LEN)?;
        let mut raw_tag = [0u8; 4];
        raw_tag.copy_from_slice(&bytes[..4]);
        let size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Some(Header { raw_tag, size })
    }

    pub fn read_header(&mut self) -> Result<Header> {
        let header = self
            .peek_header()
            .ok_or_else(|| Error::eof(self.offset(), Header::LEN, self.remaining()))?;
        self.pos += Header::LEN;
        Ok(header)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read an integer of `width` bytes, sign- or zero-extended to i64.
    pub fn read_int(&mut self, width: u8, signed: bool) -> Result<i64> {
        let v = match (width, signed) {
            (1, false) => self.read_u8()? as i64,
            (1, true) => self.read_u8()? as i8 as i64,
            (2, false) => self.read_u16()? as i64,
            (2, true) => self.read_u16()? as i16 as i64,
            (4, false) => self.read_u32()? as i64,
            (4, true) => self.read_u32()? as i32 as i64,
            (8, _) => self.read_u64()? as i64,
            _ => {
                return Err(Error::MalformedData {
                    offset: self.offset(),
                    message: format!("unsupported integer width {width}"),
                });
            }
        };
        Ok(v)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.pos + n > self.data.len() {
            return Err(Error::eof(self.offset(), n, self.remaining()));
        }
        Ok(())
    }
}

/// Start of a framed block, returned by [`Writer::begin_frame`].
#[must_use]
pub struct Frame {
    size_at: usize,
    content_at: usize,
}

/// Writer that builds a byte buffer. All writes are little-endian.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write the low `width` bytes of `v`.
    pub fn write_int(&mut self, v: i64, width: u8) {
        let bytes = v.to_le_bytes();
        self.buf.extend_from_slice(&bytes[..(width as usize).min(8)]);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    pub fn fill(&mut self, byte: u8, n: usize) {
        self.buf.resize(self.buf.len() + n, byte);
    }

    /// Emit a tag and a placeholder size; the size is patched by [`Writer::end_frame`].
    pub fn begin_frame(&mut self, tag: Tag, order: TagOrder) -> Frame {
        self.write_bytes(&tag.to_disk(order));
        let size_at = self.position();
        self.write_u32(0);
        Frame {
            size_at,
            content_at: self.position(),
        }
    }

    /// Backpatch the frame's size and pad to `align` (padding is not counted).
    pub fn end_frame(&mut self, frame: Frame, align: u32) -> u32 {
        self.end_frame_with(frame, align, None)
    }

    /// Like [`Writer::end_frame`], but re-emits `kept` instead of zeros when
    /// the frame still has the size it was read with.
    pub fn end_frame_with(&mut self, frame: Frame, align: u32, kept: Option<&Padding>) -> u32 {
        let size = (self.position() - frame.content_at) as u32;
        self.buf[frame.size_at..frame.size_at + 4].copy_from_slice(&size.to_le_bytes());
        match kept {
            Some(pad) if pad.size == size => self.write_bytes(&pad.bytes),
            _ => self.fill(0, padding(size, align)),
        }
        size
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Alignment bytes that were not plain zeros, with the content size of the
/// block they followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Padding {
    pub size: u32,
    pub bytes: Vec<u8>,
}

/// Bytes needed after a block of `size` to reach the next multiple of `align`.
pub fn padding(size: u32, align: u32) -> usize {
    if align <= 1 {
        return 0;
    }
    ((align - size % align) % align) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::tag;

    #[test]
    fn frame_backpatches_size_and_pads() {
        let mut w = Writer::new();
        let f = w.begin_frame(tag("Ver"), TagOrder::Forward);
        w.write_bytes(&[1, 2, 3, 4, 5]);
        assert_eq!(w.end_frame(f, 4), 5);
        assert_eq!(
            w.into_inner(),
            vec![b'V', b'e', b'r', 0, 5, 0, 0, 0, 1, 2, 3, 4, 5, 0, 0, 0]
        );
    }

    #[test]
    fn kept_padding_only_applies_at_the_read_size() {
        let kept = Padding {
            size: 2,
            bytes: vec![0xAA, 0xBB],
        };
        let mut w = Writer::new();
        let f = w.begin_frame(tag("Sd"), TagOrder::Forward);
        w.write_bytes(&[1, 2]);
        w.end_frame_with(f, 4, Some(&kept));
        assert_eq!(&w.into_inner()[8..], &[1, 2, 0xAA, 0xBB]);

        let mut w = Writer::new();
        let f = w.begin_frame(tag("Sd"), TagOrder::Forward);
        w.write_bytes(&[1, 2, 3]);
        w.end_frame_with(f, 4, Some(&kept));
        assert_eq!(&w.into_inner()[8..], &[1, 2, 3, 0]);
    }

    #[test]
    fn take_reports_absolute_offsets() {
        let data = [0u8; 16];
        let mut c = Cursor::new(&data);
        c.skip(6).unwrap();
        let mut sub = c.take(4).unwrap();
        assert_eq!(c.position(), 10);
        sub.skip(2).unwrap();
        assert_eq!(sub.offset(), 8);
        match sub.read_u32() {
            Err(Error::MalformedData { offset, .. }) => assert_eq!(offset, 8),
            other => panic!("expected eof, got {other:?}"),
        }
    }

    #[test]
    fn signed_reads_extend() {
        let data = [0xFF, 0xFE, 0xFF];
        let mut c = Cursor::new(&data);
        assert_eq!(c.read_int(1, true).unwrap(), -1);
        assert_eq!(c.read_int(2, false).unwrap(), 0xFFFE);
    }
}
