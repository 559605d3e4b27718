//! Little-endian primitives shared by the envelope and ledger layouts.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated: wanted {wanted} bytes at offset {at}, {available} available")]
    Truncated {
        wanted: usize,
        at: usize,
        available: usize,
    },
    #[error("string at offset {0} is not valid UTF-8")]
    Utf8(usize),
    #[error("{len} bytes do not fit a length prefix of at most {max}")]
    TooLong { len: usize, max: usize },
}

#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            buf: Vec::with_capacity(n),
        }
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// u32 length prefix, then the bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let len = u32::try_from(bytes.len()).map_err(|_| WireError::TooLong {
            len: bytes.len(),
            max: u32::MAX as usize,
        })?;
        self.put_u32(len);
        self.put_raw(bytes);
        Ok(())
    }

    /// u16 length prefix, then UTF-8.
    pub fn put_str(&mut self, s: &str) -> Result<(), WireError> {
        let len = u16::try_from(s.len()).map_err(|_| WireError::TooLong {
            len: s.len(),
            max: u16::MAX as usize,
        })?;
        self.put_u16(len);
        self.put_raw(s.as_bytes());
        Ok(())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let available = self.data.len() - self.pos;
        if n > available {
            return Err(WireError::Truncated {
                wanted: n,
                at: self.pos,
                available,
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        let at = self.pos;
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| WireError::Utf8(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_and_reader_agree() {
        let mut w = ByteWriter::new();
        w.put_u32(7);
        w.put_str("Level1").unwrap();
        w.put_bytes(&[1, 2, 3]).unwrap();
        let buf = w.into_inner();

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.u32().unwrap(), 7);
        assert_eq!(r.string().unwrap(), "Level1");
        assert_eq!(r.bytes().unwrap(), &[1, 2, 3]);
        assert!(r.is_empty());
    }

    #[test]
    fn truncation_is_reported() {
        let mut r = ByteReader::new(&[5, 0, 0, 0, 1]);
        let err = r.bytes().unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                wanted: 5,
                at: 4,
                available: 1
            }
        );
    }

    #[test]
    fn oversized_strings_are_refused_whole() {
        let mut w = ByteWriter::new();
        let long = "é".repeat(40_000);
        assert_eq!(
            w.put_str(&long),
            Err(WireError::TooLong {
                len: 80_000,
                max: u16::MAX as usize
            })
        );
        assert!(w.into_inner().is_empty());

        let mut w = ByteWriter::new();
        let fits = "x".repeat(u16::MAX as usize);
        w.put_str(&fits).unwrap();
        let buf = w.into_inner();
        assert_eq!(ByteReader::new(&buf).string().unwrap(), fits);
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut r = ByteReader::new(&[2, 0, 0xff, 0xfe]);
        assert_eq!(r.string().unwrap_err(), WireError::Utf8(0));
    }
}
