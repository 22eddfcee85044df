//! Wire format for values that leave an isolate by structural copy.
//!
//! A copy buffer is a three byte header (`b"EC"` followed by the format
//! version) and a CBOR body produced by `minicbor-serde`. Buffers are
//! immutable once encoded, so they can be shared between threads and
//! decoded into any number of destination heaps.

use std::convert::Infallible;

use bytes::{Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

const MAGIC: [u8; 2] = *b"EC";

/// Version byte written after the magic. Bump when the body layout changes.
pub const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = MAGIC.len() + 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("CBOR decode error")]
    CborDecode(#[from] minicbor_serde::error::DecodeError),
    #[error("CBOR encode error")]
    CborEncode(#[from] minicbor_serde::error::EncodeError<Infallible>),
    #[error("buffer is not a copy payload")]
    MissingHeader,
    #[error("unsupported copy format version {found} (expected {FORMAT_VERSION})")]
    UnsupportedVersion { found: u8 },
}

/// Encode `value` into a versioned copy buffer.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, Error> {
    let mut serializer = minicbor_serde::Serializer::new(CborBytesMut::with_header());
    value.serialize(serializer.serialize_unit_as_null(true))?;
    Ok(serializer.into_encoder().into_writer().freeze())
}

/// Decode a buffer produced by [`encode`].
///
/// # Errors
/// Returns error if the header is missing, the version is unknown or the
/// body does not deserialize into `T`.
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Error> {
    let body = payload(buf)?;
    let mut deserializer = minicbor_serde::Deserializer::new(body);
    Ok(T::deserialize(&mut deserializer)?)
}

/// Check the header of `buf` without decoding the body.
///
/// # Errors
/// Returns error if the header is missing or the version is unknown.
pub fn payload(buf: &[u8]) -> Result<&[u8], Error> {
    if buf.len() < HEADER_LEN || buf[..MAGIC.len()] != MAGIC {
        return Err(Error::MissingHeader);
    }
    match buf[MAGIC.len()] {
        FORMAT_VERSION => Ok(&buf[HEADER_LEN..]),
        found => Err(Error::UnsupportedVersion { found }),
    }
}

struct CborBytesMut(BytesMut);

impl CborBytesMut {
    fn with_header() -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&[FORMAT_VERSION]);
        Self(buf)
    }

    fn freeze(self) -> Bytes {
        self.0.freeze()
    }
}

impl minicbor::encode::Write for CborBytesMut {
    type Error = Infallible;

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.0.extend_from_slice(buf);
        Ok(())
    }
}
