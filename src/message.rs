//! Message codecs: typed serialization and dispatch.
//!
//! The message stage turns application objects into payload bytes on the
//! way out and routes received payloads to handlers on the way in. Type
//! identity is explicit: a [`TypeRegistry`] hands out [`TypeId`]s at
//! registration time, and the [`Typed`] codec prefixes each payload with
//! the 4-byte type id and 4-byte length.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Upper bound a [`Typed`] payload may claim, guarding against hostile
/// length fields.
const MAX_TYPED_PAYLOAD: usize = 64 * 1024 * 1024;

/// Serialization and dispatch for one item type.
pub trait Message {
    /// The application-facing item this codec carries.
    type Item;

    /// Serialize an item, or `None` when it cannot be encoded.
    fn encode(&mut self, item: &Self::Item) -> Option<Vec<u8>>;

    /// Parse `data` and hand the resulting item(s) to `handler`.
    /// Malformed payloads are dropped (with a log line), never surfaced.
    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(Self::Item));
}

/// Encode/decode counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageStats {
    /// Items successfully encoded.
    pub messages_encoded: u64,
    /// Payloads successfully dispatched.
    pub messages_decoded: u64,
    /// Bytes produced by encoding.
    pub bytes_encoded: u64,
    /// Bytes consumed by dispatch.
    pub bytes_decoded: u64,
}

/// Pass-through codec for raw byte vectors.
#[derive(Debug, Default)]
pub struct RawBytes {
    stats: MessageStats,
}

impl RawBytes {
    /// Create the codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> MessageStats {
        self.stats
    }

    /// Zero the counters.
    pub fn reset_stats(&mut self) {
        self.stats = MessageStats::default();
    }
}

impl Message for RawBytes {
    type Item = Vec<u8>;

    fn encode(&mut self, item: &Vec<u8>) -> Option<Vec<u8>> {
        self.stats.messages_encoded += 1;
        self.stats.bytes_encoded += item.len() as u64;
        Some(item.clone())
    }

    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(Vec<u8>)) {
        self.stats.messages_decoded += 1;
        self.stats.bytes_decoded += data.len() as u64;
        handler(data.to_vec());
    }
}

/// An explicit runtime type identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

/// Assigns [`TypeId`]s and remembers their names.
///
/// Registrations are explicit and usually happen at module init; there is
/// no reflection-based identity.
///
/// ```rust
/// use conduit::message::TypeRegistry;
///
/// let mut registry = TypeRegistry::new();
/// let pose = registry.register("Pose");
/// assert_eq!(registry.name(pose), Some("Pose"));
/// ```
#[derive(Debug, Default)]
pub struct TypeRegistry {
    next_id: u32,
    names: HashMap<u32, String>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type name, assigning the next free id.
    pub fn register(&mut self, name: &str) -> TypeId {
        while self.names.contains_key(&self.next_id) {
            self.next_id += 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.names.insert(id, name.to_string());
        TypeId(id)
    }

    /// Register a type under a caller-chosen id.
    pub fn register_with_id(&mut self, id: u32, name: &str) -> Result<TypeId> {
        if self.names.contains_key(&id) {
            return Err(Error::Invalid("type id already registered"));
        }
        self.names.insert(id, name.to_string());
        Ok(TypeId(id))
    }

    /// Look up a registered name.
    pub fn name(&self, id: TypeId) -> Option<&str> {
        self.names.get(&id.0).map(String::as_str)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A type-tagged payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypedPayload {
    /// The registered type of `data`.
    pub type_id: TypeId,
    /// Serialized item bytes.
    pub data: Vec<u8>,
}

impl TypedPayload {
    /// Tag `data` with `type_id`.
    pub fn new(type_id: TypeId, data: Vec<u8>) -> Self {
        Self { type_id, data }
    }
}

type TypedHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Codec carrying a 4-byte type id and 4-byte payload length before the
/// item bytes. Per-type handlers registered here win over the pipeline's
/// fallback handler.
#[derive(Default)]
pub struct Typed {
    handlers: HashMap<u32, TypedHandler>,
    stats: MessageStats,
}

impl Typed {
    /// Create the codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route payloads of `type_id` to `handler` instead of the fallback.
    pub fn register_handler(
        &mut self,
        type_id: TypeId,
        handler: impl FnMut(&[u8]) + Send + 'static,
    ) {
        self.handlers.insert(type_id.0, Box::new(handler));
    }

    /// Remove a per-type handler.
    pub fn unregister_handler(&mut self, type_id: TypeId) {
        self.handlers.remove(&type_id.0);
    }

    /// Number of per-type handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> MessageStats {
        self.stats
    }
}

impl Message for Typed {
    type Item = TypedPayload;

    fn encode(&mut self, item: &TypedPayload) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + item.data.len());
        out.extend_from_slice(&item.type_id.0.to_le_bytes());
        out.extend_from_slice(&(item.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&item.data);
        self.stats.messages_encoded += 1;
        self.stats.bytes_encoded += out.len() as u64;
        Some(out)
    }

    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(TypedPayload)) {
        if data.len() < 8 {
            tracing::warn!(len = data.len(), "typed payload shorter than its header");
            return;
        }
        let type_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;

        if size > MAX_TYPED_PAYLOAD {
            tracing::warn!(size, "typed payload claims an absurd size");
            return;
        }
        if data.len() < 8 + size {
            tracing::warn!(
                claimed = size,
                present = data.len() - 8,
                "typed payload truncated"
            );
            return;
        }

        self.stats.messages_decoded += 1;
        self.stats.bytes_decoded += data.len() as u64;

        let body = &data[8..8 + size];
        if let Some(registered) = self.handlers.get_mut(&type_id) {
            registered(body);
        } else {
            handler(TypedPayload::new(TypeId(type_id), body.to_vec()));
        }
    }
}

/// JSON codec over `serde_json::Value`.
///
/// Unparseable input is handed to the handler as a raw string value, so
/// the receive loop never stalls on malformed peers.
#[derive(Debug, Default)]
pub struct Json {
    stats: MessageStats,
    parse_errors: u64,
}

impl Json {
    /// Create the codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads that failed to parse.
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> MessageStats {
        self.stats
    }
}

impl Message for Json {
    type Item = serde_json::Value;

    fn encode(&mut self, item: &serde_json::Value) -> Option<Vec<u8>> {
        match serde_json::to_vec(item) {
            Ok(bytes) => {
                self.stats.messages_encoded += 1;
                self.stats.bytes_encoded += bytes.len() as u64;
                Some(bytes)
            }
            Err(err) => {
                tracing::error!(%err, "json encode failed");
                None
            }
        }
    }

    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(serde_json::Value)) {
        match serde_json::from_slice(data) {
            Ok(value) => {
                self.stats.messages_decoded += 1;
                self.stats.bytes_decoded += data.len() as u64;
                handler(value);
            }
            Err(err) => {
                self.parse_errors += 1;
                tracing::warn!(%err, "json parse failed, passing raw text");
                handler(serde_json::Value::String(
                    String::from_utf8_lossy(data).into_owned(),
                ));
            }
        }
    }
}

/// Illustrative XOR obfuscation layer around another codec.
///
/// Not encryption — a placeholder with the shape of one.
pub struct Xor<M> {
    base: M,
    key: u8,
}

impl<M> Xor<M> {
    /// Wrap `base` with the default key.
    pub fn new(base: M) -> Self {
        Self { base, key: 0xAA }
    }

    /// Wrap `base` with an explicit key byte.
    pub fn with_key(base: M, key: u8) -> Self {
        Self { base, key }
    }

    /// The wrapped codec.
    pub fn base(&self) -> &M {
        &self.base
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ self.key).collect()
    }
}

impl<M: Message> Message for Xor<M> {
    type Item = M::Item;

    fn encode(&mut self, item: &M::Item) -> Option<Vec<u8>> {
        let encoded = self.base.encode(item)?;
        Some(self.apply(&encoded))
    }

    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(M::Item)) {
        let clear = self.apply(data);
        self.base.dispatch(&clear, handler);
    }
}

/// Compression envelope around another codec: a one-byte marker, with the
/// body stored verbatim. Uncompressed input passes through untouched.
pub struct Compressed<M> {
    base: M,
}

const COMPRESSED_MARKER: u8 = 1;

impl<M> Compressed<M> {
    /// Wrap `base`.
    pub fn new(base: M) -> Self {
        Self { base }
    }

    /// The wrapped codec.
    pub fn base(&self) -> &M {
        &self.base
    }
}

impl<M: Message> Message for Compressed<M> {
    type Item = M::Item;

    fn encode(&mut self, item: &M::Item) -> Option<Vec<u8>> {
        let encoded = self.base.encode(item)?;
        let mut out = Vec::with_capacity(1 + encoded.len());
        out.push(COMPRESSED_MARKER);
        out.extend_from_slice(&encoded);
        Some(out)
    }

    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(M::Item)) {
        match data.split_first() {
            Some((&COMPRESSED_MARKER, body)) => self.base.dispatch(body, handler),
            Some(_) => self.base.dispatch(data, handler),
            None => {}
        }
    }
}
