//! Bounded memo of resolved members
//!
//! Keys carry the wire signature key, which is only a hash. Every hit is
//! checked against the exact parameter tags it was resolved for; a mismatch
//! is treated as a miss and re-resolved from the registry.

use std::any::TypeId;
use std::collections::VecDeque;
use std::sync::Arc;

use ape_shared::{MemberKind, TypeTag};
use tracing::trace;

use crate::registry::{Constructor, Member, TypeRegistry};

const GETTERS: usize = 10;
const INVOKERS: usize = 10;
const CONSTRUCTORS: usize = 10;
const PARAMETER_TYPES: usize = 3;

/// Fixed-capacity map evicting the oldest insertion first
pub struct BoundedCache<K, V> {
    capacity: usize,
    entries: VecDeque<(K, V)>,
}

impl<K: PartialEq, V: Clone> BoundedCache<K, V> {
    /// Empty cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Cached value for `key`
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Insert or replace
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((key, value));
    }

    /// Entries held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemberKey {
    type_id: TypeId,
    kind: MemberKind,
    name: String,
    signature: u64,
}

#[derive(Clone)]
struct Resolved<F> {
    params: Arc<[TypeTag]>,
    call: F,
}

/// Caches in front of the [`TypeRegistry`]
pub struct InvocationCache {
    getters: BoundedCache<MemberKey, Resolved<Member>>,
    invokers: BoundedCache<MemberKey, Resolved<Member>>,
    constructors: BoundedCache<(String, u64), Resolved<Constructor>>,
    parameter_types: BoundedCache<u64, Arc<[TypeTag]>>,
}

impl InvocationCache {
    /// Empty caches
    pub fn new() -> Self {
        Self {
            getters: BoundedCache::new(GETTERS),
            invokers: BoundedCache::new(INVOKERS),
            constructors: BoundedCache::new(CONSTRUCTORS),
            parameter_types: BoundedCache::new(PARAMETER_TYPES),
        }
    }

    /// Accessor or invoker for a member, resolving on a miss
    pub fn member(
        &mut self,
        registry: &TypeRegistry,
        type_id: TypeId,
        kind: MemberKind,
        name: &str,
        params: &[TypeTag],
        signature: u64,
    ) -> Option<Member> {
        let cache = if params.is_empty() && matches!(kind, MemberKind::Field | MemberKind::Property) {
            &mut self.getters
        } else {
            &mut self.invokers
        };
        let key = MemberKey {
            type_id,
            kind,
            name: name.to_string(),
            signature,
        };

        if let Some(hit) = cache.get(&key) {
            if *hit.params == *params {
                trace!(member = name, ?kind, "invocation cache hit");
                return Some(hit.call);
            }
            trace!(member = name, signature, "signature collision, resolving again");
        }

        let call = registry.member(type_id, kind, name, params)?;
        cache.insert(
            key,
            Resolved {
                params: params.into(),
                call: call.clone(),
            },
        );
        Some(call)
    }

    /// Constructor for a registered type name, resolving on a miss
    pub fn constructor(
        &mut self,
        registry: &TypeRegistry,
        type_name: &str,
        params: &[TypeTag],
        signature: u64,
    ) -> Option<Constructor> {
        let key = (type_name.to_string(), signature);
        if let Some(hit) = self.constructors.get(&key)
            && *hit.params == *params
        {
            return Some(hit.call);
        }

        let call = registry.constructor(type_name, params)?;
        self.constructors.insert(
            key,
            Resolved {
                params: params.into(),
                call: call.clone(),
            },
        );
        Some(call)
    }

    /// Shared parameter tag list for a signature
    pub fn parameter_types(&mut self, signature: u64, tags: &[TypeTag]) -> Arc<[TypeTag]> {
        if let Some(hit) = self.parameter_types.get(&signature)
            && *hit == *tags
        {
            return hit;
        }
        let shared: Arc<[TypeTag]> = tags.into();
        self.parameter_types.insert(signature, shared.clone());
        shared
    }
}

impl Default for InvocationCache {
    fn default() -> Self {
        Self::new()
    }
}
