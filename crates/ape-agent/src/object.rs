//! Host objects as the agent sees them

use std::any::{Any, TypeId};
use std::sync::Arc;

use ape_shared::Value;

/// Shared, type-erased reference to a host object
#[derive(Clone)]
pub struct Object {
    inner: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl Object {
    /// Wrap a value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap an already shared value without copying it
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            inner: value,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Identity of the concrete type
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Rust name of the concrete type
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrow as `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Shared handle as `T`
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.clone().downcast::<T>().ok()
    }

    /// True when both refer to the same allocation
    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Object({})", self.type_name)
    }
}

/// Slot content, member argument or member result
#[derive(Debug, Clone)]
pub enum Item {
    /// Plain value that can travel on the wire
    Value(Value),
    /// Reference that stays inside the agent
    Object(Object),
}

impl Item {
    /// Null result
    pub fn null() -> Self {
        Item::Value(Value::Empty)
    }

    /// Wrap anything convertible to a [`Value`]
    pub fn value(value: impl Into<Value>) -> Self {
        Item::Value(value.into())
    }

    /// Wrap a host object
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Item::Object(Object::new(value))
    }

    /// The value, when this is one
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Item::Value(v) => Some(v),
            Item::Object(_) => None,
        }
    }

    /// The object, when this is one
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Item::Object(o) => Some(o),
            Item::Value(_) => None,
        }
    }
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Item::Value(value)
    }
}

impl From<Object> for Item {
    fn from(object: Object) -> Self {
        Item::Object(object)
    }
}
