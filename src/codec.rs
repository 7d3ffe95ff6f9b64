//! Operation encoding
//!
//! The transport only moves opaque payloads; a `Codec` turns typed operations
//! into payloads and payloads back into typed responses.

use crate::errors::CodecError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

pub trait Codec: Send + Sync {
    type Operation;
    type Response;

    fn encode(&self, operation: &Self::Operation) -> Result<Bytes, CodecError>;

    fn decode(&self, payload: Bytes) -> Result<Self::Response, CodecError>;
}

/// JSON encoding of serde types
pub struct JsonCodec<Op, Resp> {
    _types: PhantomData<fn(&Op) -> Resp>,
}

impl<Op, Resp> JsonCodec<Op, Resp> {
    pub fn new() -> Self {
        Self { _types: PhantomData }
    }
}

impl<Op, Resp> Default for JsonCodec<Op, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Op, Resp> Codec for JsonCodec<Op, Resp>
where
    Op: Serialize,
    Resp: DeserializeOwned,
{
    type Operation = Op;
    type Response = Resp;

    fn encode(&self, operation: &Op) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(operation)?))
    }

    fn decode(&self, payload: Bytes) -> Result<Resp, CodecError> {
        Ok(serde_json::from_slice(&payload)?)
    }
}
