//! Type registry: type tag -> codec + handler.
//!
//! Handlers are written against a concrete payload type `T`. Registration
//! wraps them with a codec into an object-safe [`ErasedHandler`] so the
//! dispatcher can route raw rows by a plain map lookup.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::model::{Failure, JobId, Trigger};

/// Error type handlers return. Anything displayable converts into it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = std::result::Result<(), BoxError>;

// ---------------------------------------------------------------------------
// Payloads and codecs
// ---------------------------------------------------------------------------

/// A value that can travel through the queue.
///
/// The default type tag is the bare type name (`PingMsg` for
/// `my_app::msgs::PingMsg<T>`), which is what producers and handlers agree
/// on when neither side names a tag explicitly. The derived tag only makes
/// sense for named types: tuples, arrays and references produce tags that
/// [`validate_type_tag`] rejects, so such payloads must override
/// `type_tag` or go through an explicit tag.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    fn type_tag() -> &'static str {
        short_type_name::<Self>()
    }
}

/// Last path segment of a type name, without generic arguments.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Check that `tag` can name a job type.
///
/// Tags must be non-empty and free of whitespace and the punctuation that
/// `std::any::type_name` emits for unnamed types.
pub fn validate_type_tag(tag: &str) -> Result<()> {
    const FORBIDDEN: &[char] = &['(', ')', '[', ']', '{', '}', '<', '>', '&', '*', ',', ';'];
    if tag.is_empty() || tag.contains(|c: char| c.is_whitespace() || FORBIDDEN.contains(&c)) {
        return Err(Error::InvalidTypeTag(tag.to_string()));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Encode/decode contract for one payload shape.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> std::result::Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> std::result::Result<T, CodecError>;
}

/// JSON via serde. Decoding is strict against `T`'s shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec {
    fn encode(&self, value: &T) -> std::result::Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> std::result::Result<T, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// What a handler knows about the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub job_type: String,
    pub trigger: Trigger,
}

/// Runs one decoded payload.
///
/// Handlers are synchronous. On the commit-hook path they run while the
/// producer still holds the queue's connection; calls back into the same
/// queue from there fail with [`Error::Reentrant`].
pub trait Handler<T>: Send + Sync + 'static {
    fn handle(&self, ctx: &JobContext, payload: T) -> HandlerResult;
}

impl<T, F> Handler<T> for F
where
    F: Fn(&JobContext, T) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, ctx: &JobContext, payload: T) -> HandlerResult {
        self(ctx, payload)
    }
}

/// Object-safe handler over raw payload bytes.
pub trait ErasedHandler: Send + Sync {
    fn invoke(&self, ctx: &JobContext, payload: &[u8]) -> std::result::Result<(), Failure>;
}

struct TypedHandler<T, C, H> {
    codec: C,
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T, C, H> ErasedHandler for TypedHandler<T, C, H>
where
    T: 'static,
    C: Codec<T>,
    H: Handler<T>,
{
    fn invoke(&self, ctx: &JobContext, payload: &[u8]) -> std::result::Result<(), Failure> {
        let value = self.codec.decode(payload).map_err(|e| Failure::Decode {
            job_type: ctx.job_type.clone(),
            message: e.to_string(),
        })?;
        self.handler
            .handle(ctx, value)
            .map_err(|e| Failure::Handler(e.to_string()))
    }
}

/// A type tag bound to its payload shape and callback.
#[derive(Clone)]
pub struct HandlerDescriptor {
    type_tag: String,
    handler: Arc<dyn ErasedHandler>,
}

impl HandlerDescriptor {
    /// Descriptor for `T` under its derived tag, using JSON.
    pub fn new<T, H>(handler: H) -> Self
    where
        T: Payload,
        H: Handler<T>,
    {
        Self::with_codec(T::type_tag(), JsonCodec, handler)
    }

    /// Same as [`HandlerDescriptor::new`] for a closure.
    pub fn from_fn<T, F>(f: F) -> Self
    where
        T: Payload,
        F: Fn(&JobContext, T) -> HandlerResult + Send + Sync + 'static,
    {
        Self::new::<T, F>(f)
    }

    /// Descriptor with an explicit tag and codec.
    pub fn with_codec<T, C, H>(type_tag: impl Into<String>, codec: C, handler: H) -> Self
    where
        T: 'static,
        C: Codec<T>,
        H: Handler<T>,
    {
        Self {
            type_tag: type_tag.into(),
            handler: Arc::new(TypedHandler {
                codec,
                handler,
                _marker: PhantomData,
            }),
        }
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn invoke(&self, ctx: &JobContext, payload: &[u8]) -> std::result::Result<(), Failure> {
        self.handler.invoke(ctx, payload)
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("type_tag", &self.type_tag)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Tag -> descriptor map.
///
/// Built mutably during setup, then frozen behind an `Arc` for dispatch.
/// A tag can be registered once; a second registration is rejected.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    handlers: HashMap<String, HandlerDescriptor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a JSON handler for payloads of type `T` under `type_tag`.
    pub fn register<T, F>(&mut self, type_tag: impl Into<String>, f: F) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(&JobContext, T) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(HandlerDescriptor::with_codec::<T, _, F>(type_tag, JsonCodec, f))
    }

    /// Add a prepared descriptor.
    pub fn on(&mut self, descriptor: HandlerDescriptor) -> Result<()> {
        let tag = descriptor.type_tag();
        validate_type_tag(tag)?;
        if self.handlers.contains_key(tag) {
            return Err(Error::DuplicateType(tag.to_string()));
        }
        self.handlers.insert(tag.to_string(), descriptor);
        Ok(())
    }

    pub fn resolve(&self, type_tag: &str) -> Option<&HandlerDescriptor> {
        self.handlers.get(type_tag)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
