//! Tag-struct codec.
//!
//! Every value in a control packet is prefixed with a one-byte type tag,
//! making packets self-describing: a reader always knows whether the next
//! value has the type it expects. Integers are big-endian.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::proplist::Proplist;
use crate::sample::{SampleFormat, SampleSpec};

const TAG_STRING: u8 = b't';
const TAG_STRING_NULL: u8 = b'N';
const TAG_U32: u8 = b'L';
const TAG_U8: u8 = b'B';
const TAG_U64: u8 = b'R';
const TAG_SAMPLE_SPEC: u8 = b'a';
const TAG_ARBITRARY: u8 = b'x';
const TAG_BOOLEAN_TRUE: u8 = b'1';
const TAG_BOOLEAN_FALSE: u8 = b'0';
const TAG_USEC: u8 = b'U';
const TAG_PROPLIST: u8 = b'P';

/// Failure while reading a tag-struct.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum GetError {
    #[error("tagstruct exhausted")]
    UnexpectedEof,
    #[error("type tag mismatch: expected {expected:#04x}, found {found:#04x}")]
    TypeMismatch { expected: u8, found: u8 },
    #[error("malformed value: {0}")]
    Invalid(&'static str),
}

/// A tag-struct being built or consumed.
///
/// Writes append at the end; reads consume from the front and never see
/// bytes written after the read cursor passed them.
#[derive(Debug, Default, Clone)]
pub struct TagStruct {
    data: BytesMut,
    rindex: usize,
}

impl TagStruct {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an inbound packet payload for reading.
    pub fn from_bytes(data: Bytes) -> Self {
        Self {
            data: BytesMut::from(&data[..]),
            rindex: 0,
        }
    }

    /// The serialized form.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }

    /// True once every value has been consumed.
    pub fn eof(&self) -> bool {
        self.rindex >= self.data.len()
    }

    // === Writers ===

    pub fn put_u32(&mut self, v: u32) {
        self.data.put_u8(TAG_U32);
        self.data.put_u32(v);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.put_u8(TAG_U8);
        self.data.put_u8(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.put_u8(TAG_U64);
        self.data.put_u64(v);
    }

    pub fn put_usec(&mut self, v: u64) {
        self.data.put_u8(TAG_USEC);
        self.data.put_u64(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.data
            .put_u8(if v { TAG_BOOLEAN_TRUE } else { TAG_BOOLEAN_FALSE });
    }

    /// A string value; `None` encodes the distinguished null string.
    pub fn put_string(&mut self, s: Option<&str>) {
        match s {
            Some(s) => {
                self.data.put_u8(TAG_STRING);
                self.data.put_slice(s.as_bytes());
                self.data.put_u8(0);
            }
            None => self.data.put_u8(TAG_STRING_NULL),
        }
    }

    pub fn put_arbitrary(&mut self, bytes: &[u8]) {
        self.data.put_u8(TAG_ARBITRARY);
        self.data.put_u32(bytes.len() as u32);
        self.data.put_slice(bytes);
    }

    pub fn put_sample_spec(&mut self, ss: &SampleSpec) {
        self.data.put_u8(TAG_SAMPLE_SPEC);
        self.data.put_u8(ss.format as u8);
        self.data.put_u8(ss.channels);
        self.data.put_u32(ss.rate);
    }

    pub fn put_proplist(&mut self, p: &Proplist) {
        self.data.put_u8(TAG_PROPLIST);
        for (key, value) in p.iter() {
            self.put_string(Some(key));
            self.put_u32(value.len() as u32);
            self.put_arbitrary(value);
        }
        self.put_string(None);
    }

    // === Readers ===

    fn peek_tag(&self) -> Result<u8, GetError> {
        self.data
            .get(self.rindex)
            .copied()
            .ok_or(GetError::UnexpectedEof)
    }

    fn expect_tag(&mut self, expected: u8) -> Result<(), GetError> {
        let found = self.peek_tag()?;
        if found != expected {
            return Err(GetError::TypeMismatch { expected, found });
        }
        self.rindex += 1;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&[u8], GetError> {
        if self.data.len() - self.rindex < n {
            return Err(GetError::UnexpectedEof);
        }
        let out = &self.data[self.rindex..self.rindex + n];
        self.rindex += n;
        Ok(out)
    }

    pub fn get_u32(&mut self) -> Result<u32, GetError> {
        self.expect_tag(TAG_U32)?;
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u8(&mut self) -> Result<u8, GetError> {
        self.expect_tag(TAG_U8)?;
        Ok(self.take(1)?[0])
    }

    pub fn get_u64(&mut self) -> Result<u64, GetError> {
        self.expect_tag(TAG_U64)?;
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(b.try_into().expect("8 bytes")))
    }

    pub fn get_usec(&mut self) -> Result<u64, GetError> {
        self.expect_tag(TAG_USEC)?;
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(b.try_into().expect("8 bytes")))
    }

    pub fn get_bool(&mut self) -> Result<bool, GetError> {
        match self.peek_tag()? {
            TAG_BOOLEAN_TRUE => {
                self.rindex += 1;
                Ok(true)
            }
            TAG_BOOLEAN_FALSE => {
                self.rindex += 1;
                Ok(false)
            }
            found => Err(GetError::TypeMismatch {
                expected: TAG_BOOLEAN_TRUE,
                found,
            }),
        }
    }

    pub fn get_string(&mut self) -> Result<Option<String>, GetError> {
        match self.peek_tag()? {
            TAG_STRING_NULL => {
                self.rindex += 1;
                Ok(None)
            }
            TAG_STRING => {
                self.rindex += 1;
                let rest = &self.data[self.rindex..];
                let nul = rest
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(GetError::Invalid("unterminated string"))?;
                let s = std::str::from_utf8(&rest[..nul])
                    .map_err(|_| GetError::Invalid("string is not UTF-8"))?
                    .to_string();
                self.rindex += nul + 1;
                Ok(Some(s))
            }
            found => Err(GetError::TypeMismatch {
                expected: TAG_STRING,
                found,
            }),
        }
    }

    /// Read an arbitrary run that must have exactly `len` bytes.
    pub fn get_arbitrary(&mut self, len: usize) -> Result<Vec<u8>, GetError> {
        self.expect_tag(TAG_ARBITRARY)?;
        let b = self.take(4)?;
        let wire_len = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize;
        if wire_len != len {
            return Err(GetError::Invalid("arbitrary length mismatch"));
        }
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_sample_spec(&mut self) -> Result<SampleSpec, GetError> {
        self.expect_tag(TAG_SAMPLE_SPEC)?;
        let b = self.take(6)?;
        let format =
            SampleFormat::from_wire(b[0]).ok_or(GetError::Invalid("unknown sample format"))?;
        let channels = b[1];
        let rate = u32::from_be_bytes([b[2], b[3], b[4], b[5]]);
        Ok(SampleSpec::new(format, rate, channels))
    }

    pub fn get_proplist(&mut self) -> Result<Proplist, GetError> {
        self.expect_tag(TAG_PROPLIST)?;
        let mut p = Proplist::new();
        loop {
            let Some(key) = self.get_string()? else {
                return Ok(p);
            };
            let len = self.get_u32()? as usize;
            let value = self.get_arbitrary(len)?;
            if !p.set(&key, &value) {
                return Err(GetError::Invalid("invalid proplist key"));
            }
        }
    }
}
