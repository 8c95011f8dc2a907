//! Values as seen by templates.
//!
//! Plain JSON is adapted into variants carrying the method surfaces of the Java
//! collections the template language was designed around. Containers have reference
//! semantics: mutating a nested map through `$a.b.put(..)` is visible through every
//! other handle to it, which is why they live behind `Rc<RefCell<..>>`.

use std::{
    cell::{Ref, RefCell},
    fmt,
    rc::Rc,
};

use indexmap::IndexMap;
use serde_json::{Map, Number, Value};

use crate::RenderError;

#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(Number),
}

#[derive(Clone, Default)]
pub enum TemplateValue {
    /// A reference that resolved to nothing at all, as opposed to an explicit null.
    #[default]
    Undefined,
    Scalar(Scalar),
    String(StringValue),
    List(ListValue),
    Map(MapValue),
    /// Host objects such as the `$util` namespaces.
    Native(NativeValue),
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StringValue(Rc<str>);

#[derive(Clone, Default)]
pub struct ListValue(Rc<RefCell<Vec<TemplateValue>>>);

#[derive(Clone, Default)]
pub struct MapValue(Rc<RefCell<IndexMap<String, TemplateValue>>>);

#[derive(Clone)]
pub struct NativeValue(Rc<dyn NativeObject>);

/// An object implemented by the host and exposed to templates.
pub trait NativeObject {
    fn type_name(&self) -> &'static str;

    fn property(&self, _name: &str) -> Option<TemplateValue> {
        None
    }

    fn call(&self, method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError>;
}

/// Conversion into a [`TemplateValue`]. Adapting an adapted value returns it unchanged.
pub trait Adapt {
    fn adapt(self) -> TemplateValue;
}

pub fn adapt(value: impl Adapt) -> TemplateValue {
    value.adapt()
}

pub fn unadapt(value: &TemplateValue) -> Value {
    value.to_json()
}

impl Adapt for TemplateValue {
    fn adapt(self) -> TemplateValue {
        self
    }
}

impl Adapt for Value {
    fn adapt(self) -> TemplateValue {
        match self {
            Value::Null => TemplateValue::null(),
            Value::Bool(b) => TemplateValue::Scalar(Scalar::Bool(b)),
            Value::Number(n) => TemplateValue::Scalar(Scalar::Number(n)),
            Value::String(s) => TemplateValue::String(StringValue::from(s)),
            Value::Array(items) => TemplateValue::List(ListValue::new(items.into_iter().map(Adapt::adapt).collect())),
            Value::Object(object) => TemplateValue::Map(MapValue::new(
                object.into_iter().map(|(key, value)| (key, value.adapt())).collect(),
            )),
        }
    }
}

impl Adapt for &Value {
    fn adapt(self) -> TemplateValue {
        self.clone().adapt()
    }
}

impl TemplateValue {
    pub fn null() -> Self {
        TemplateValue::Scalar(Scalar::Null)
    }

    pub fn native(object: impl NativeObject + 'static) -> Self {
        TemplateValue::Native(NativeValue(Rc::new(object)))
    }

    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, TemplateValue::Undefined | TemplateValue::Scalar(Scalar::Null))
    }

    /// Only null, undefined and `false` are false.
    pub fn is_truthy(&self) -> bool {
        !matches!(
            self,
            TemplateValue::Undefined | TemplateValue::Scalar(Scalar::Null | Scalar::Bool(false))
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TemplateValue::Undefined => "undefined",
            TemplateValue::Scalar(Scalar::Null) => "null",
            TemplateValue::Scalar(Scalar::Bool(_)) => "boolean",
            TemplateValue::Scalar(Scalar::Number(_)) => "number",
            TemplateValue::String(_) => "string",
            TemplateValue::List(_) => "list",
            TemplateValue::Map(_) => "map",
            TemplateValue::Native(native) => native.0.type_name(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TemplateValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&Number> {
        match self {
            TemplateValue::Scalar(Scalar::Number(n)) => Some(n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_number().and_then(Number::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_number().and_then(Number::as_f64)
    }

    pub fn as_list(&self) -> Option<&ListValue> {
        match self {
            TemplateValue::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match self {
            TemplateValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&dyn NativeObject> {
        match self {
            TemplateValue::Native(native) => Some(native.0.as_ref()),
            _ => None,
        }
    }

    /// Identity comparison for containers, value comparison otherwise.
    pub fn ptr_eq(&self, other: &TemplateValue) -> bool {
        match (self, other) {
            (TemplateValue::List(a), TemplateValue::List(b)) => Rc::ptr_eq(&a.0, &b.0),
            (TemplateValue::Map(a), TemplateValue::Map(b)) => Rc::ptr_eq(&a.0, &b.0),
            (TemplateValue::Native(a), TemplateValue::Native(b)) => Rc::ptr_eq(&a.0, &b.0),
            _ => self == other,
        }
    }

    /// Structure preserving conversion back to JSON. Undefined and host objects become null.
    pub fn to_json(&self) -> Value {
        match self {
            TemplateValue::Undefined | TemplateValue::Native(_) => Value::Null,
            TemplateValue::Scalar(Scalar::Null) => Value::Null,
            TemplateValue::Scalar(Scalar::Bool(b)) => Value::Bool(*b),
            TemplateValue::Scalar(Scalar::Number(n)) => Value::Number(n.clone()),
            TemplateValue::String(s) => Value::String(s.as_str().to_string()),
            TemplateValue::List(list) => Value::Array(list.borrow().iter().map(TemplateValue::to_json).collect()),
            TemplateValue::Map(map) => Value::Object(
                map.borrow()
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    /// A detached copy sharing no container with `self`.
    pub fn deep_copy(&self) -> TemplateValue {
        match self {
            TemplateValue::List(list) => {
                TemplateValue::List(ListValue::new(list.snapshot().iter().map(TemplateValue::deep_copy).collect()))
            }
            TemplateValue::Map(map) => TemplateValue::Map(MapValue::new(
                map.entries()
                    .into_iter()
                    .map(|(key, value)| (key, value.deep_copy()))
                    .collect(),
            )),
            other => other.clone(),
        }
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        TemplateValue::String(StringValue::from(value))
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        TemplateValue::String(StringValue::from(value))
    }
}

impl From<bool> for TemplateValue {
    fn from(value: bool) -> Self {
        TemplateValue::Scalar(Scalar::Bool(value))
    }
}

impl From<i32> for TemplateValue {
    fn from(value: i32) -> Self {
        TemplateValue::Scalar(Scalar::Number(value.into()))
    }
}

impl From<i64> for TemplateValue {
    fn from(value: i64) -> Self {
        TemplateValue::Scalar(Scalar::Number(value.into()))
    }
}

impl From<usize> for TemplateValue {
    fn from(value: usize) -> Self {
        TemplateValue::Scalar(Scalar::Number(value.into()))
    }
}

impl From<Number> for TemplateValue {
    fn from(value: Number) -> Self {
        TemplateValue::Scalar(Scalar::Number(value))
    }
}

impl From<Vec<TemplateValue>> for TemplateValue {
    fn from(value: Vec<TemplateValue>) -> Self {
        TemplateValue::List(ListValue::new(value))
    }
}

impl From<MapValue> for TemplateValue {
    fn from(value: MapValue) -> Self {
        TemplateValue::Map(value)
    }
}

impl PartialEq for TemplateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TemplateValue::Undefined, TemplateValue::Undefined) => true,
            (TemplateValue::Scalar(a), TemplateValue::Scalar(b)) => a == b,
            (TemplateValue::String(a), TemplateValue::String(b)) => a == b,
            (TemplateValue::List(a), TemplateValue::List(b)) => Rc::ptr_eq(&a.0, &b.0) || *a.borrow() == *b.borrow(),
            (TemplateValue::Map(a), TemplateValue::Map(b)) => Rc::ptr_eq(&a.0, &b.0) || *a.borrow() == *b.borrow(),
            (TemplateValue::Native(a), TemplateValue::Native(b)) => Rc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

/// Java `toString` rendering: `[a, b]` for lists and `{k=v}` for maps.
impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateValue::Undefined | TemplateValue::Scalar(Scalar::Null) => f.write_str("null"),
            TemplateValue::Scalar(Scalar::Bool(b)) => write!(f, "{b}"),
            TemplateValue::Scalar(Scalar::Number(n)) => write!(f, "{n}"),
            TemplateValue::String(s) => f.write_str(s.as_str()),
            TemplateValue::List(list) => {
                f.write_str("[")?;
                for (i, item) in list.borrow().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            TemplateValue::Map(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.borrow().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}={value}")?;
                }
                f.write_str("}")
            }
            TemplateValue::Native(native) => write!(f, "<{}>", native.0.type_name()),
        }
    }
}

impl fmt::Debug for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateValue::Undefined => f.write_str("Undefined"),
            TemplateValue::Native(native) => write!(f, "Native({})", native.0.type_name()),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl StringValue {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StringValue {
    fn from(value: &str) -> Self {
        StringValue(Rc::from(value))
    }
}

impl From<String> for StringValue {
    fn from(value: String) -> Self {
        StringValue(Rc::from(value))
    }
}

impl fmt::Debug for StringValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl NativeValue {
    pub fn property_of(&self, name: &str) -> Option<TemplateValue> {
        self.0.property(name)
    }

    pub fn call(&self, method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError> {
        self.0.call(method, args)
    }
}

impl ListValue {
    pub fn new(items: Vec<TemplateValue>) -> Self {
        ListValue(Rc::new(RefCell::new(items)))
    }

    pub fn borrow(&self) -> Ref<'_, Vec<TemplateValue>> {
        self.0.borrow()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<TemplateValue> {
        self.0.borrow().get(index).cloned()
    }

    pub fn push(&self, value: TemplateValue) {
        self.0.borrow_mut().push(value);
    }

    pub fn contains(&self, value: &TemplateValue) -> bool {
        self.0.borrow().iter().any(|item| item == value)
    }

    /// Removes the first element equal to `value`.
    pub fn remove_value(&self, value: &TemplateValue) -> bool {
        let position = self.0.borrow().iter().position(|item| item == value);
        match position {
            Some(index) => {
                self.0.borrow_mut().remove(index);
                true
            }
            None => false,
        }
    }

    pub fn insert(&self, index: usize, value: TemplateValue) {
        self.0.borrow_mut().insert(index, value);
    }

    pub fn set(&self, index: usize, value: TemplateValue) -> Option<TemplateValue> {
        self.0
            .borrow_mut()
            .get_mut(index)
            .map(|slot| std::mem::replace(slot, value))
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    /// Copies the elements out so that the list may be mutated while iterating the copy.
    pub fn snapshot(&self) -> Vec<TemplateValue> {
        self.0.borrow().clone()
    }
}

impl MapValue {
    pub fn new(entries: IndexMap<String, TemplateValue>) -> Self {
        MapValue(Rc::new(RefCell::new(entries)))
    }

    pub fn borrow(&self) -> Ref<'_, IndexMap<String, TemplateValue>> {
        self.0.borrow()
    }

    /// Missing keys yield null, never undefined.
    pub fn get(&self, key: &str) -> TemplateValue {
        self.0.borrow().get(key).cloned().unwrap_or_else(TemplateValue::null)
    }

    pub fn insert(&self, key: impl Into<String>, value: TemplateValue) -> Option<TemplateValue> {
        self.0.borrow_mut().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<TemplateValue> {
        self.0.borrow_mut().shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.borrow().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(String, TemplateValue)> {
        self.0
            .borrow()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}
