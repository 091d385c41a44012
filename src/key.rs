//! Query keys.
//!
//! A query is addressed by a [`KeyInput`]: either a single literal, or a list of parts mixing
//! literals with reactive sources. [`resolve_key`] turns the input into an
//! [`Atom`] holding the current [`CompositeKey`], re-deriving it whenever a reactive part changes.
//!
//! A key resolves to `None` while any part is unset (`None` or `false`). That is not an error:
//! it is how a caller disables fetching until a dependency is known.
//!
//! Parts are joined by plain concatenation in declaration order, so `["ab", "c"]` and
//! `["a", "bc"]` both resolve to `"abc"`. Callers that need distinct keys must choose parts that
//! cannot collide.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::atom::{Atom, Unsubscribe};
use crate::lock::mutex_lock;
use crate::query::{QueryStore, QueryValue};

const SOURCE: &str = "key";

/// A literal key part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl KeyValue {
    /// `false` counts as unset; every other literal is set.
    pub const fn is_set(&self) -> bool {
        !matches!(self, Self::Bool(false))
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for KeyValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for KeyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// One part of a multi-part key.
#[derive(Clone)]
pub enum KeyPart {
    /// A fixed literal.
    Literal(KeyValue),
    /// A value that may change or be unset.
    Reactive(Atom<Option<KeyValue>>),
    /// Another query: contributes that query's key once it holds data, and is unset before.
    Query(QueryStore),
}

impl fmt::Debug for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Reactive(atom) => f.debug_tuple("Reactive").field(&atom.get()).finish(),
            Self::Query(store) => f.debug_tuple("Query").field(&store.key()).finish(),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Literal(value.into())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Literal(value.into())
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        Self::Literal(value.into())
    }
}

impl From<KeyValue> for KeyPart {
    fn from(value: KeyValue) -> Self {
        Self::Literal(value)
    }
}

impl From<Atom<Option<KeyValue>>> for KeyPart {
    fn from(atom: Atom<Option<KeyValue>>) -> Self {
        Self::Reactive(atom)
    }
}

impl From<&Atom<Option<KeyValue>>> for KeyPart {
    fn from(atom: &Atom<Option<KeyValue>>) -> Self {
        Self::Reactive(atom.clone())
    }
}

impl From<QueryStore> for KeyPart {
    fn from(store: QueryStore) -> Self {
        Self::Query(store)
    }
}

impl From<&QueryStore> for KeyPart {
    fn from(store: &QueryStore) -> Self {
        Self::Query(store.clone())
    }
}

/// What a caller passes to identify a query.
#[derive(Debug, Clone)]
pub enum KeyInput {
    /// A single literal; the key never changes.
    Single(KeyValue),
    /// Parts joined in order.
    Parts(Vec<KeyPart>),
}

impl KeyInput {
    /// Builds a multi-part key.
    pub fn parts(parts: impl IntoIterator<Item = KeyPart>) -> Self {
        Self::Parts(parts.into_iter().collect())
    }
}

impl From<&str> for KeyInput {
    fn from(value: &str) -> Self {
        Self::Single(value.into())
    }
}

impl From<String> for KeyInput {
    fn from(value: String) -> Self {
        Self::Single(value.into())
    }
}

impl From<KeyValue> for KeyInput {
    fn from(value: KeyValue) -> Self {
        Self::Single(value)
    }
}

impl From<Vec<KeyPart>> for KeyInput {
    fn from(parts: Vec<KeyPart>) -> Self {
        Self::Parts(parts)
    }
}

impl<const N: usize> From<[KeyPart; N]> for KeyInput {
    fn from(parts: [KeyPart; N]) -> Self {
        Self::Parts(parts.into())
    }
}

/// A fully resolved key: the joined string plus the parts it was built from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    /// Joined key string; this is the cache address.
    pub key: String,
    /// Resolved parts in declaration order.
    pub parts: Vec<KeyValue>,
}

impl CompositeKey {
    /// Joins `parts`, or returns `None` if any of them is unset.
    pub fn from_parts(parts: Vec<KeyValue>) -> Option<Self> {
        if !parts.iter().all(KeyValue::is_set) {
            return None;
        }
        let key = parts.iter().map(ToString::to_string).collect();
        Some(Self { key, parts })
    }

    /// A key made of one literal.
    pub fn single(value: impl Into<KeyValue>) -> Option<Self> {
        Self::from_parts(vec![value.into()])
    }
}

/// Resolves `input` into an observable composite key.
///
/// The returned [`Unsubscribe`] detaches from every reactive part; for a single literal it is a
/// no-op. Query parts are subscribed to, which mounts them.
pub fn resolve_key(input: &KeyInput) -> (Atom<Option<CompositeKey>>, Unsubscribe) {
    let parts = match input {
        KeyInput::Single(value) => {
            return (
                Atom::new(CompositeKey::single(value.clone())),
                Unsubscribe::noop(),
            );
        }
        KeyInput::Parts(parts) => parts,
    };

    let slots: Vec<Option<KeyValue>> = parts
        .iter()
        .map(|part| match part {
            KeyPart::Literal(value) => Some(value.clone()),
            KeyPart::Reactive(_) | KeyPart::Query(_) => None,
        })
        .collect();

    let resolver = Arc::new(Resolver {
        slots: Mutex::new(slots),
        ready: AtomicBool::new(false),
        key: Atom::new(None),
    });

    let mut unsubscribes = Vec::new();
    for (index, part) in parts.iter().enumerate() {
        match part {
            KeyPart::Literal(_) => {}
            KeyPart::Reactive(atom) => {
                let resolver = Arc::clone(&resolver);
                unsubscribes.push(atom.subscribe(move |value: &Option<KeyValue>| {
                    resolver.assign(index, value.clone());
                }));
            }
            KeyPart::Query(store) => {
                let resolver = Arc::clone(&resolver);
                let source = store.clone();
                unsubscribes.push(store.subscribe(move |value: &QueryValue| {
                    let part = if value.data.is_some() {
                        source.key().map(KeyValue::Str)
                    } else {
                        None
                    };
                    resolver.assign(index, part);
                }));
            }
        }
    }

    resolver.ready.store(true, Ordering::SeqCst);
    resolver.recompute();

    (resolver.key.clone(), Unsubscribe::all(unsubscribes))
}

struct Resolver {
    slots: Mutex<Vec<Option<KeyValue>>>,
    // Suppresses recomputation while the initial subscriptions replay their values.
    ready: AtomicBool,
    key: Atom<Option<CompositeKey>>,
}

impl Resolver {
    fn assign(&self, index: usize, value: Option<KeyValue>) {
        mutex_lock(&self.slots, SOURCE, "assign")[index] = value;
        if self.ready.load(Ordering::SeqCst) {
            self.recompute();
        }
    }

    fn recompute(&self) {
        let slots = mutex_lock(&self.slots, SOURCE, "recompute").clone();
        let next = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .and_then(CompositeKey::from_parts);
        trace!(key = next.as_ref().map(|k| k.key.as_str()), "key resolved");
        self.key.set(next);
    }
}
