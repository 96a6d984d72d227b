use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheError;

/// Converts between a cached value and its byte representation.
///
/// The cache itself only ever moves bytes; codecs live at the seam so callers
/// can cache raw buffers, structured objects, or anything in between.
pub trait Codec<V>: Send + Sync {
    fn encode(&self, value: &V) -> Result<Bytes, CacheError>;
    fn decode(&self, bytes: &[u8]) -> Result<V, CacheError>;
}

/// Bytes-in, bytes-out.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityCodec;

impl Codec<Bytes> for IdentityCodec {
    fn encode(&self, value: &Bytes) -> Result<Bytes, CacheError> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes, CacheError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// Structured-object codec over JSON.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<Bytes, CacheError> {
        serde_json::to_vec(value).map(Bytes::from).map_err(CacheError::encoding)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CacheError> {
        serde_json::from_slice(bytes).map_err(CacheError::decoding)
    }
}

/// Maps user keys to the keys the tiers operate on. Must be pure.
pub trait KeyEncoder: Send + Sync {
    fn encode(&self, key: &str) -> String;
}

/// Pass keys through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityKeyEncoder;

impl KeyEncoder for IdentityKeyEncoder {
    fn encode(&self, key: &str) -> String {
        key.to_owned()
    }
}

/// Collision-resistant digest encoder for production deployments whose raw
/// keys are long or contain arbitrary bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct DigestKeyEncoder;

impl KeyEncoder for DigestKeyEncoder {
    fn encode(&self, key: &str) -> String {
        blake3::hash(key.as_bytes()).to_hex().to_string()
    }
}
