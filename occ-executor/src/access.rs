//! Access operations: what a transaction says it will touch.
//!
//! Declarations are produced outside the engine, one ordered list per message
//! of each transaction. They only shape the dependency graph; a declaration
//! that is never used costs some concurrency, and an access that was never
//! declared is still caught by validation.

use crate::types::TxnIndex;
use alloy_primitives::Bytes;
use serde_json::Value as Json;
use std::fmt;

/// Kind of access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
    Iterate,
    /// Any effect at all; ordered like a write.
    Unknown,
}

impl AccessType {
    /// Whether later accesses of any kind must wait for this one.
    pub fn is_write_like(self) -> bool {
        matches!(self, AccessType::Write | AccessType::Unknown)
    }
}

/// Identifier of an accessed resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceId {
    /// Wildcard: overlaps with every resource.
    Any,
    /// A concrete, opaque resource name.
    Named(Bytes),
}

impl ResourceId {
    pub fn named(name: impl AsRef<[u8]>) -> Self {
        ResourceId::Named(Bytes::copy_from_slice(name.as_ref()))
    }

    pub fn is_any(&self) -> bool {
        matches!(self, ResourceId::Any)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Any => write!(f, "ANY"),
            ResourceId::Named(name) => write!(f, "{}", name),
        }
    }
}

/// A declared (or observed) access by one message of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessOperation {
    pub access_type: AccessType,
    pub resource: ResourceId,
    pub txn_idx: TxnIndex,
    pub msg_idx: usize,
}

impl AccessOperation {
    pub fn new(
        access_type: AccessType,
        resource: ResourceId,
        txn_idx: TxnIndex,
        msg_idx: usize,
    ) -> Self {
        Self {
            access_type,
            resource,
            txn_idx,
            msg_idx,
        }
    }

    /// The conservative fallback: UNKNOWN on ANY.
    pub fn wildcard(txn_idx: TxnIndex, msg_idx: usize) -> Self {
        Self::new(AccessType::Unknown, ResourceId::Any, txn_idx, msg_idx)
    }

    /// Whether this operation forces ordering against every other resource.
    pub fn is_wildcard(&self) -> bool {
        self.resource.is_any()
    }
}

/// Declared access operations of one transaction, one list per message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnAccessOps {
    pub messages: Vec<Vec<AccessOperation>>,
}

impl TxnAccessOps {
    pub fn new(messages: Vec<Vec<AccessOperation>>) -> Self {
        Self { messages }
    }

    /// A transaction with `num_messages` messages about which nothing is
    /// known: each message declares the wildcard.
    pub fn wildcard(txn_idx: TxnIndex, num_messages: usize) -> Self {
        Self {
            messages: (0..num_messages.max(1))
                .map(|msg_idx| vec![AccessOperation::wildcard(txn_idx, msg_idx)])
                .collect(),
        }
    }

    pub fn num_messages(&self) -> usize {
        self.messages.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccessOperation> {
        self.messages.iter().flatten()
    }
}

/// Builds operations for one message while keeping index bookkeeping out of
/// the caller.
#[derive(Debug)]
pub struct MessageAccess {
    txn_idx: TxnIndex,
    msg_idx: usize,
    ops: Vec<AccessOperation>,
}

impl MessageAccess {
    pub fn new(txn_idx: TxnIndex, msg_idx: usize) -> Self {
        Self {
            txn_idx,
            msg_idx,
            ops: Vec::new(),
        }
    }

    pub fn op(mut self, access_type: AccessType, resource: ResourceId) -> Self {
        self.ops.push(AccessOperation::new(
            access_type,
            resource,
            self.txn_idx,
            self.msg_idx,
        ));
        self
    }

    pub fn read(self, resource: ResourceId) -> Self {
        self.op(AccessType::Read, resource)
    }

    pub fn write(self, resource: ResourceId) -> Self {
        self.op(AccessType::Write, resource)
    }

    /// READ followed by WRITE on the same resource.
    pub fn read_write(self, resource: ResourceId) -> Self {
        self.read(resource.clone()).write(resource)
    }

    pub fn iterate(self, resource: ResourceId) -> Self {
        self.op(AccessType::Iterate, resource)
    }

    pub fn wildcard(self) -> Self {
        self.op(AccessType::Unknown, ResourceId::Any)
    }

    pub fn build(self) -> Vec<AccessOperation> {
        self.ops
    }
}

/// Derives a resource identifier from a field of a JSON message body.
///
/// The body is decoded into a structured value and the leaf is encoded with a
/// type tag, so `"5"` and `5`, or a string that merely contains quote
/// characters, never map to the same identifier. Anything that does not
/// resolve to a scalar leaf yields `None`; callers must then declare the
/// wildcard instead of guessing.
#[derive(Debug, Clone)]
pub struct JsonFieldExtractor {
    prefix: Bytes,
    path: Vec<String>,
}

const TAG_STRING: u8 = b's';
const TAG_NUMBER: u8 = b'n';
const TAG_BOOL: u8 = b'b';

impl JsonFieldExtractor {
    /// `prefix` namespaces the derived identifiers; `path` is the sequence of
    /// object fields to follow.
    pub fn new(prefix: impl AsRef<[u8]>, path: &[&str]) -> Self {
        Self {
            prefix: Bytes::copy_from_slice(prefix.as_ref()),
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn extract(&self, body: &[u8]) -> Option<ResourceId> {
        let root: Json = serde_json::from_slice(body).ok()?;
        let mut node = &root;
        for field in &self.path {
            node = node.as_object()?.get(field)?;
        }

        let (tag, payload) = match node {
            Json::String(s) => (TAG_STRING, s.as_bytes().to_vec()),
            Json::Number(n) => (TAG_NUMBER, n.to_string().into_bytes()),
            Json::Bool(b) => (TAG_BOOL, vec![u8::from(*b)]),
            Json::Null | Json::Array(_) | Json::Object(_) => return None,
        };

        let mut id = Vec::with_capacity(self.prefix.len() + 1 + payload.len());
        id.extend_from_slice(&self.prefix);
        id.push(tag);
        id.extend_from_slice(&payload);
        Some(ResourceId::Named(Bytes::from(id)))
    }

    /// Declares `access_type` on the extracted resource, or the wildcard when
    /// extraction fails.
    pub fn declare(
        &self,
        body: &[u8],
        access_type: AccessType,
        txn_idx: TxnIndex,
        msg_idx: usize,
    ) -> AccessOperation {
        match self.extract(body) {
            Some(resource) => AccessOperation::new(access_type, resource, txn_idx, msg_idx),
            None => AccessOperation::wildcard(txn_idx, msg_idx),
        }
    }
}
