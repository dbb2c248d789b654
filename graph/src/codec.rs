//! Length-prefixed framing for procedure inputs and outputs.
//!
//! Fixed-width fields are big-endian; strings carry a u32 length prefix.
//! The decoder borrows the payload, so string views cost nothing.

use bytes::{BufMut, BytesMut};

use crate::error::{CResult, Error};

pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Wraps a recycled arena buffer.
    pub fn with_buffer(buf: BytesMut) -> Self {
        Self { buf }
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64(v);
    }

    pub fn put_string(&mut self, v: &str) {
        self.buf.put_u32(v.len() as u32);
        self.buf.put(v.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_buffer(self) -> BytesMut {
        self.buf
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn reset(&mut self) {
        self.pos = 0;
    }

    pub fn empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> CResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::InvalidInput(format!(
                "payload truncated: wanted {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.data.len() - self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_bool(&mut self) -> CResult<bool> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn get_u8(&mut self) -> CResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_i32(&mut self) -> CResult<i32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().map_err(|_| unreachable_len())?;
        Ok(i32::from_be_bytes(bytes))
    }

    pub fn get_i64(&mut self) -> CResult<i64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().map_err(|_| unreachable_len())?;
        Ok(i64::from_be_bytes(bytes))
    }

    pub fn get_f64(&mut self) -> CResult<f64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().map_err(|_| unreachable_len())?;
        Ok(f64::from_be_bytes(bytes))
    }

    pub fn get_u32(&mut self) -> CResult<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().map_err(|_| unreachable_len())?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Borrowed string view into the payload.
    pub fn get_str(&mut self) -> CResult<&'a str> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map_err(|e| Error::InvalidInput(format!("non-utf8 string: {}", e)))
    }

    pub fn get_string(&mut self) -> CResult<String> {
        Ok(self.get_str()?.to_string())
    }
}

fn unreachable_len() -> Error {
    Error::Internal("slice length mismatch".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() -> CResult<()> {
        let mut enc = Encoder::new();
        enc.put_bool(true);
        enc.put_u8(7);
        enc.put_i32(-5);
        enc.put_i64(1 << 40);
        enc.put_f64(0.25);
        enc.put_string("QUERY_VERTEX");

        let bytes = enc.as_slice().to_vec();
        let mut dec = Decoder::new(&bytes);
        assert!(dec.get_bool()?);
        assert_eq!(dec.get_u8()?, 7);
        assert_eq!(dec.get_i32()?, -5);
        assert_eq!(dec.get_i64()?, 1 << 40);
        assert_eq!(dec.get_f64()?, 0.25);
        assert_eq!(dec.get_str()?, "QUERY_VERTEX");
        assert!(dec.empty());

        dec.reset();
        assert!(!dec.empty());
        Ok(())
    }

    #[test]
    fn truncation_is_invalid_input() {
        let mut enc = Encoder::new();
        enc.put_i64(42);
        let bytes = &enc.as_slice()[..4];
        let mut dec = Decoder::new(bytes);
        assert!(matches!(dec.get_i64().unwrap_err(), Error::InvalidInput(_)));
    }
}
