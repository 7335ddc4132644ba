// Copyright (c) 2015-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Python values
//!
//! Mutable containers (lists, dicts, sets, byte arrays, objects) are held
//! behind `Rc<RefCell<..>>` so that the memo table, the stack, and the
//! decoded result all observe the same allocation.  This is what makes
//! back-references and cyclic graphs come out right: `MEMOIZE` records the
//! same handle that a later `BUILD` or `APPEND` mutates.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::error::{Error, ErrorCode, Result};
use crate::torch::storage::Storage;
use crate::torch::tensor::Tensor;
use crate::typed::TypedData;

/// Nesting depth after which `Debug` output is elided.  Decoded graphs may
/// be cyclic, so the formatter must not recurse without bound.
const MAX_DEBUG_DEPTH: usize = 16;

/// A value decoded from a pickle stream.
#[derive(Clone)]
pub enum Value {
    /// None
    None,
    /// Boolean
    Bool(bool),
    /// Machine-sized integer
    I64(i64),
    /// Big integer
    Int(BigInt),
    /// Float
    F64(f64),
    /// Unicode string
    String(String),
    /// Bytestring
    Bytes(Vec<u8>),
    /// Mutable byte buffer
    ByteArray(Rc<RefCell<Vec<u8>>>),
    /// List
    List(Rc<RefCell<Vec<Value>>>),
    /// Tuple
    Tuple(Rc<Vec<Value>>),
    /// Dictionary, preserving insertion order
    Dict(Rc<RefCell<Dict>>),
    /// collections.OrderedDict
    OrderedDict(Rc<RefCell<OrderedDict>>),
    /// Set
    Set(Rc<RefCell<Set>>),
    /// Frozen (immutable) set
    FrozenSet(Rc<Set>),
    /// Reference to a class (module + qualified name)
    Class(Rc<ClassRef>),
    /// Instance of a class the registry did not resolve further
    Object(Rc<RefCell<Object>>),
    /// A callable registered with the class registry
    Callable(Rc<dyn Callable>),
    /// Typed numeric array (array.array)
    Array(Rc<TypedData>),
    /// Tensor storage handle
    Storage(Rc<RefCell<Storage>>),
    /// Tensor record
    Tensor(Rc<Tensor>),
}

/// An insertion-ordered mapping with Python dict semantics.
///
/// Lookup is a linear scan by value equality; checkpoint metadata dicts are
/// small, and preserving insertion order and key identity matters more here
/// than asymptotics.
#[derive(Default, Debug, PartialEq)]
pub struct Dict {
    pairs: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new() -> Dict {
        Dict { pairs: Vec::new() }
    }

    /// Sets a key/value pair.  An existing key is overwritten in place,
    /// keeping its insertion position.  Fails if the key is not hashable.
    pub fn set(&mut self, key: Value, value: Value) -> Result<()> {
        if !key.is_hashable() {
            return Err(Error::Syntax(ErrorCode::ValueNotHashable));
        }
        for (k, v) in &mut self.pairs {
            if *k == key {
                *v = value;
                return Ok(());
            }
        }
        self.pairs.push((key, value));
        Ok(())
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Convenience string-keyed lookup.
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.pairs.iter()
            .find(|(k, _)| matches!(k, Value::String(s) if s == key))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(Value, Value)] {
        &self.pairs
    }
}

/// An unordered collection of unique hashable values.
#[derive(Default, Debug)]
pub struct Set {
    items: Vec<Value>,
}

impl Set {
    pub fn new() -> Set {
        Set { items: Vec::new() }
    }

    pub fn add(&mut self, item: Value) -> Result<()> {
        if !item.is_hashable() {
            return Err(Error::Syntax(ErrorCode::ValueNotHashable));
        }
        if !self.items.contains(&item) {
            self.items.push(item);
        }
        Ok(())
    }

    pub fn has(&self, item: &Value) -> bool {
        self.items.contains(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }
}

/// collections.OrderedDict: the entries plus the instance `__dict__`, which
/// the producer uses for sidecar attributes (e.g. `_metadata` on PyTorch
/// state dicts) applied via the BUILD opcode.
#[derive(Default, Debug)]
pub struct OrderedDict {
    pub entries: Dict,
    pub attrs: Dict,
}

impl OrderedDict {
    pub fn new() -> OrderedDict {
        OrderedDict::default()
    }

    pub fn set(&mut self, key: Value, value: Value) -> Result<()> {
        self.entries.set(key, value)
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A (module, qualified name) pair naming a producer-side class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassRef {
    pub module: String,
    pub name: String,
}

impl ClassRef {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> ClassRef {
        ClassRef { module: module.into(), name: name.into() }
    }
}

impl fmt::Display for ClassRef {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.module, self.name)
    }
}

/// An instance of a class that only exists on the producer side.  Carries
/// the constructor arguments verbatim; BUILD fills in attributes or the
/// opaque state.
#[derive(Debug, Default)]
pub struct Object {
    pub class: ClassRef,
    pub args: Vec<Value>,
    pub state: Option<Value>,
    pub attrs: Dict,
}

impl Default for ClassRef {
    fn default() -> ClassRef {
        ClassRef::new("builtins", "object")
    }
}

impl Object {
    pub fn new(class: ClassRef, args: Vec<Value>) -> Object {
        Object { class, args, state: None, attrs: Dict::new() }
    }
}

/// A value that can be invoked by the REDUCE / NEWOBJ / INST family of
/// opcodes.  Implemented by the registry's built-in constructors and by
/// whatever the caller registers.
pub trait Callable {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Invoke with the argument tuple's contents.
    fn call(&self, args: Vec<Value>) -> Result<Value>;
}

impl Value {
    /// Wraps a list in its shared handle.
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    /// Wraps a tuple in its shared handle.
    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I64(i) => Some(i),
            Value::Int(ref i) => i.to_i64(),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        match *self {
            Value::I64(i) => i.to_usize(),
            Value::Int(ref i) => i.to_usize(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F64(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match *self {
            Value::String(ref s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match *self {
            Value::Bytes(ref b) => Some(b),
            _ => None,
        }
    }

    /// Clones out the items of a list.
    pub fn list_items(&self) -> Option<Vec<Value>> {
        match *self {
            Value::List(ref l) => Some(l.borrow().clone()),
            _ => None,
        }
    }

    /// Clones out the items of a tuple.
    pub fn tuple_items(&self) -> Option<Vec<Value>> {
        match *self {
            Value::Tuple(ref t) => Some(t.as_ref().clone()),
            _ => None,
        }
    }

    /// Whether the value may be used as a dict key or set item.
    pub fn is_hashable(&self) -> bool {
        match *self {
            Value::None | Value::Bool(_) | Value::I64(_) | Value::Int(_) |
            Value::F64(_) | Value::String(_) | Value::Bytes(_) |
            Value::FrozenSet(_) | Value::Class(_) => true,
            Value::Tuple(ref items) => items.iter().all(Value::is_hashable),
            _ => false,
        }
    }

    /// Short name of the variant, for diagnostics.
    pub(crate) fn type_name(&self) -> &'static str {
        match *self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::I64(_) | Value::Int(_) => "int",
            Value::F64(_) => "float",
            Value::String(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::ByteArray(_) => "bytearray",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::OrderedDict(_) => "OrderedDict",
            Value::Set(_) => "set",
            Value::FrozenSet(_) => "frozenset",
            Value::Class(_) => "class",
            Value::Object(_) => "object",
            Value::Callable(_) => "callable",
            Value::Array(_) => "array",
            Value::Storage(_) => "storage",
            Value::Tensor(_) => "tensor",
        }
    }

    fn fmt_depth(&self, fmt: &mut fmt::Formatter, depth: usize) -> fmt::Result {
        if depth > MAX_DEBUG_DEPTH {
            return fmt.write_str("...");
        }
        let fmt_seq = |fmt: &mut fmt::Formatter, items: &[Value],
                       open: &str, close: &str| -> fmt::Result {
            fmt.write_str(open)?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 { fmt.write_str(", ")?; }
                item.fmt_depth(fmt, depth + 1)?;
            }
            fmt.write_str(close)
        };
        let fmt_pairs = |fmt: &mut fmt::Formatter, dict: &Dict| -> fmt::Result {
            fmt.write_str("{")?;
            for (i, (k, v)) in dict.pairs().iter().enumerate() {
                if i > 0 { fmt.write_str(", ")?; }
                k.fmt_depth(fmt, depth + 1)?;
                fmt.write_str(": ")?;
                v.fmt_depth(fmt, depth + 1)?;
            }
            fmt.write_str("}")
        };
        match *self {
            Value::None => fmt.write_str("None"),
            Value::Bool(b) => write!(fmt, "{}", if b { "True" } else { "False" }),
            Value::I64(i) => write!(fmt, "{}", i),
            Value::Int(ref i) => write!(fmt, "{}", i),
            Value::F64(f) => write!(fmt, "{:?}", f),
            Value::String(ref s) => write!(fmt, "{:?}", s),
            Value::Bytes(ref b) => write!(fmt, "b{:?}", b),
            Value::ByteArray(ref b) => write!(fmt, "bytearray({:?})", b.borrow()),
            Value::List(ref l) => fmt_seq(fmt, &l.borrow(), "[", "]"),
            Value::Tuple(ref t) => fmt_seq(fmt, t, "(", ")"),
            Value::Dict(ref d) => fmt_pairs(fmt, &d.borrow()),
            Value::OrderedDict(ref d) => {
                fmt.write_str("OrderedDict(")?;
                fmt_pairs(fmt, &d.borrow().entries)?;
                fmt.write_str(")")
            }
            Value::Set(ref s) => fmt_seq(fmt, s.borrow().items(), "{", "}"),
            Value::FrozenSet(ref s) => {
                fmt.write_str("frozenset(")?;
                fmt_seq(fmt, s.items(), "{", "}")?;
                fmt.write_str(")")
            }
            Value::Class(ref c) => write!(fmt, "<class {}>", c),
            Value::Object(ref o) => write!(fmt, "<{} object>", o.borrow().class),
            Value::Callable(ref c) => write!(fmt, "<callable {}>", c.name()),
            Value::Array(ref a) => write!(fmt, "array({:?})", a),
            Value::Storage(ref s) => {
                let s = s.borrow();
                write!(fmt, "<storage {:?} size={} location={:?}>",
                       s.kind, s.size, s.location)
            }
            Value::Tensor(ref t) => write!(fmt, "<tensor size={:?} stride={:?} offset={}>",
                                           t.size, t.stride, t.offset),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_depth(fmt, 0)
    }
}

/// Content equality for immutable values, reference identity for mutable
/// containers and objects (the same list pickled twice must compare equal
/// to itself, not to a copy).
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::I64(a), Value::Int(b)) |
            (Value::Int(b), Value::I64(a)) => BigInt::from(*a).cmp(b) == Ordering::Equal,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::FrozenSet(a), Value::FrozenSet(b)) =>
                a.len() == b.len() && a.items().iter().all(|item| b.has(item)),
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::ByteArray(a), Value::ByteArray(b)) => Rc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::OrderedDict(a), Value::OrderedDict(b)) => Rc::ptr_eq(a, b),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Callable(a), Value::Callable(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Storage(a), Value::Storage(b)) => Rc::ptr_eq(a, b),
            (Value::Tensor(a), Value::Tensor(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}
