//! Explicit member tables standing in for runtime reflection
//!
//! Each host type the controller may touch is registered once with typed
//! closures for its fields, properties, indexers, methods and element
//! accessor. Overloads are told apart by their exact parameter tag lists.
//!
//! ```ignore
//! registry
//!     .register::<Form>("System.Windows.Forms.Form")
//!     .property("Text", |form| Ok(Item::value(form.text())))
//!     .method("Close", &[], |form, _| { form.close(); Ok(Item::null()) })
//!     .constructor(&[TypeTag::String], |args| Ok(Item::object(Form::new(value_at(args, 0)?))));
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use ape_shared::{MemberKind, TypeTag, Value};

use crate::error::HandlerError;
use crate::object::{Item, Object};

/// Type-erased member accessor or invoker
pub type Member = Arc<dyn Fn(&Object, &[Item]) -> Result<Item, HandlerError> + Send + Sync>;

/// Type-erased constructor
pub type Constructor = Arc<dyn Fn(&[Item]) -> Result<Item, HandlerError> + Send + Sync>;

struct Overload<F> {
    params: Vec<TypeTag>,
    call: F,
}

fn pick<F: Clone>(overloads: Option<&Vec<Overload<F>>>, params: &[TypeTag]) -> Option<F> {
    overloads?
        .iter()
        .find(|o| o.params == params)
        .map(|o| o.call.clone())
}

fn is_integral(tag: TypeTag) -> bool {
    matches!(
        tag,
        TypeTag::SByte
            | TypeTag::Byte
            | TypeTag::Int16
            | TypeTag::UInt16
            | TypeTag::Int32
            | TypeTag::UInt32
            | TypeTag::Int64
            | TypeTag::UInt64
    )
}

#[derive(Default)]
struct TypeTable {
    name: String,
    fields: HashMap<String, Member>,
    properties: HashMap<String, Vec<Overload<Member>>>,
    methods: HashMap<String, Vec<Overload<Member>>>,
    element: Option<Member>,
}

/// Member tables for every registered host type
#[derive(Default)]
pub struct TypeRegistry {
    types: HashMap<TypeId, TypeTable>,
    constructors: HashMap<String, Vec<Overload<Constructor>>>,
}

impl TypeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or continue) registering `T` under its full type name
    pub fn register<T: Any + Send + Sync>(&mut self, full_name: impl Into<String>) -> TypeBuilder<'_, T> {
        let full_name = full_name.into();
        self.types.entry(TypeId::of::<T>()).or_default().name = full_name.clone();
        TypeBuilder {
            registry: self,
            full_name,
            _type: PhantomData,
        }
    }

    /// Registered name of a type
    pub fn type_name(&self, type_id: TypeId) -> Option<&str> {
        self.types.get(&type_id).map(|t| t.name.as_str())
    }

    /// Member of `kind` on the type, matching `params` exactly
    pub fn member(
        &self,
        type_id: TypeId,
        kind: MemberKind,
        name: &str,
        params: &[TypeTag],
    ) -> Option<Member> {
        let table = self.types.get(&type_id)?;
        match kind {
            MemberKind::Field if params.is_empty() => table.fields.get(name).cloned(),
            MemberKind::Field => None,
            MemberKind::Property => pick(table.properties.get(name), params),
            MemberKind::Method => pick(table.methods.get(name), params),
            MemberKind::ArrayElement => match params {
                [tag] if is_integral(*tag) => table.element.clone(),
                _ => None,
            },
            MemberKind::Constructor => None,
        }
    }

    /// Constructor of the type registered as `type_name`, matching `params` exactly
    pub fn constructor(&self, type_name: &str, params: &[TypeTag]) -> Option<Constructor> {
        pick(self.constructors.get(type_name), params)
    }
}

/// Adds members to one registered type
pub struct TypeBuilder<'a, T> {
    registry: &'a mut TypeRegistry,
    full_name: String,
    _type: PhantomData<fn(&T)>,
}

impl<T: Any + Send + Sync> TypeBuilder<'_, T> {
    fn table(&mut self) -> &mut TypeTable {
        self.registry.types.entry(TypeId::of::<T>()).or_default()
    }

    fn erase<F>(call: F) -> Member
    where
        F: Fn(&T, &[Item]) -> Result<Item, HandlerError> + Send + Sync + 'static,
    {
        Arc::new(move |target: &Object, args: &[Item]| {
            let typed = target
                .downcast_ref::<T>()
                .ok_or_else(|| HandlerError::mismatch(std::any::type_name::<T>(), target))?;
            call(typed, args)
        })
    }

    /// Plain field read
    pub fn field<F>(mut self, name: &str, read: F) -> Self
    where
        F: Fn(&T) -> Item + Send + Sync + 'static,
    {
        let member = Self::erase(move |target, _| Ok(read(target)));
        self.table().fields.insert(name.to_string(), member);
        self
    }

    /// Property getter
    pub fn property<F>(self, name: &str, get: F) -> Self
    where
        F: Fn(&T) -> Result<Item, HandlerError> + Send + Sync + 'static,
    {
        self.indexer(name, &[], move |target, _| get(target))
    }

    /// Property taking arguments (indexed property or setter)
    pub fn indexer<F>(mut self, name: &str, params: &[TypeTag], call: F) -> Self
    where
        F: Fn(&T, &[Item]) -> Result<Item, HandlerError> + Send + Sync + 'static,
    {
        let overload = Overload {
            params: params.to_vec(),
            call: Self::erase(call),
        };
        self.table()
            .properties
            .entry(name.to_string())
            .or_default()
            .push(overload);
        self
    }

    /// Method overload
    pub fn method<F>(mut self, name: &str, params: &[TypeTag], call: F) -> Self
    where
        F: Fn(&T, &[Item]) -> Result<Item, HandlerError> + Send + Sync + 'static,
    {
        let overload = Overload {
            params: params.to_vec(),
            call: Self::erase(call),
        };
        self.table()
            .methods
            .entry(name.to_string())
            .or_default()
            .push(overload);
        self
    }

    /// Element accessor for array-like types
    pub fn element<F>(mut self, at: F) -> Self
    where
        F: Fn(&T, usize) -> Result<Item, HandlerError> + Send + Sync + 'static,
    {
        let member = Self::erase(move |target, args| {
            let value = value_at(args, 0)?;
            let index = value
                .as_i64()
                .and_then(|i| usize::try_from(i).ok())
                .ok_or_else(|| HandlerError::mismatch("element index", value))?;
            at(target, index)
        });
        self.table().element = Some(member);
        self
    }

    /// Constructor overload, found by the name given to [`TypeRegistry::register`]
    pub fn constructor<F>(self, params: &[TypeTag], call: F) -> Self
    where
        F: Fn(&[Item]) -> Result<Item, HandlerError> + Send + Sync + 'static,
    {
        let overload = Overload {
            params: params.to_vec(),
            call: Arc::new(call) as Constructor,
        };
        self.registry
            .constructors
            .entry(self.full_name.clone())
            .or_default()
            .push(overload);
        self
    }
}

/// Plain-value argument at `index`
pub fn value_at(args: &[Item], index: usize) -> Result<&Value, HandlerError> {
    match args.get(index) {
        Some(Item::Value(value)) => Ok(value),
        Some(Item::Object(object)) => Err(HandlerError::mismatch("a value", object)),
        None => Err(HandlerError::InvalidOperation(format!("missing argument {index}"))),
    }
}

/// Object argument at `index`, borrowed as `T`
pub fn object_at<T: Any>(args: &[Item], index: usize) -> Result<&T, HandlerError> {
    match args.get(index) {
        Some(Item::Object(object)) => object
            .downcast_ref::<T>()
            .ok_or_else(|| HandlerError::mismatch(std::any::type_name::<T>(), object)),
        Some(Item::Value(value)) => Err(HandlerError::mismatch("an object", value)),
        None => Err(HandlerError::InvalidOperation(format!("missing argument {index}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Label {
        text: Mutex<String>,
        cells: Vec<i32>,
    }

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry
            .register::<Label>("Demo.Label")
            .field("cells_len", |l| Item::value(l.cells.len() as i32))
            .property("Text", |l| {
                Ok(Item::value(l.text.lock().unwrap().clone()))
            })
            .indexer("Text", &[TypeTag::String], |l, args| {
                *l.text.lock().unwrap() = value_at(args, 0)?.as_str().unwrap_or_default().into();
                Ok(Item::null())
            })
            .method("Pad", &[TypeTag::Int32], |l, args| {
                let n = value_at(args, 0)?.as_i64().unwrap_or(0) as usize;
                Ok(Item::value(format!("{:>n$}", l.text.lock().unwrap())))
            })
            .method("Pad", &[TypeTag::String], |_, args| {
                Ok(Item::value(format!("by {:?}", value_at(args, 0)?)))
            })
            .element(|l, i| {
                l.cells
                    .get(i)
                    .map(|c| Item::value(*c))
                    .ok_or_else(|| HandlerError::raised("IndexOutOfRange", format!("{i}")))
            })
            .constructor(&[TypeTag::String], |args| {
                Ok(Item::object(Label {
                    text: Mutex::new(value_at(args, 0)?.as_str().unwrap_or_default().into()),
                    cells: vec![],
                }))
            });
        registry
    }

    fn label() -> Object {
        Object::new(Label {
            text: Mutex::new("hi".into()),
            cells: vec![10, 20],
        })
    }

    fn call(registry: &TypeRegistry, target: &Object, kind: MemberKind, name: &str, args: &[Value]) -> Item {
        let tags: Vec<_> = args.iter().map(Value::tag).collect();
        let items: Vec<_> = args.iter().cloned().map(Item::Value).collect();
        registry
            .member(target.type_id(), kind, name, &tags)
            .unwrap()(target, &items)
        .unwrap()
    }

    #[test]
    fn test_property_get_and_set() {
        let registry = registry();
        let target = label();
        call(&registry, &target, MemberKind::Property, "Text", &["new".into()]);
        let text = call(&registry, &target, MemberKind::Property, "Text", &[]);
        assert_eq!(text.as_value().unwrap().as_str(), Some("new"));
    }

    #[test]
    fn test_overloads_by_tags() {
        let registry = registry();
        let target = label();
        let padded = call(&registry, &target, MemberKind::Method, "Pad", &[Value::Int32(4)]);
        assert_eq!(padded.as_value().unwrap().as_str(), Some("  hi"));
        let other = call(&registry, &target, MemberKind::Method, "Pad", &["x".into()]);
        assert!(other.as_value().unwrap().as_str().unwrap().starts_with("by"));

        // No Int64 overload
        assert!(
            registry
                .member(target.type_id(), MemberKind::Method, "Pad", &[TypeTag::Int64])
                .is_none()
        );
    }

    #[test]
    fn test_field_and_element() {
        let registry = registry();
        let target = label();
        let len = call(&registry, &target, MemberKind::Field, "cells_len", &[]);
        assert_eq!(len.as_value(), Some(&Value::Int32(2)));
        let cell = call(&registry, &target, MemberKind::ArrayElement, "", &[Value::UInt16(1)]);
        assert_eq!(cell.as_value(), Some(&Value::Int32(20)));

        let missing = registry
            .member(target.type_id(), MemberKind::ArrayElement, "", &[TypeTag::Int32])
            .unwrap()(&target, &[Item::value(9)]);
        assert_eq!(missing.unwrap_err().type_name(), "IndexOutOfRange");
    }

    #[test]
    fn test_constructor_by_full_name() {
        let registry = registry();
        assert!(registry.constructor("Demo.Label", &[]).is_none());
        let made = registry.constructor("Demo.Label", &[TypeTag::String]).unwrap()(&[Item::value("c")])
            .unwrap();
        let object = made.as_object().unwrap();
        assert_eq!(registry.type_name(object.type_id()), Some("Demo.Label"));
    }

    #[test]
    fn test_member_rejects_foreign_target() {
        let registry = registry();
        let member = registry
            .member(TypeId::of::<Label>(), MemberKind::Property, "Text", &[])
            .unwrap();
        let err = member(&Object::new(1u8), &[]).unwrap_err();
        assert!(matches!(err, HandlerError::TypeMismatch { .. }));
    }
}
