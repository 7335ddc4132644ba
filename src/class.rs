// Copyright (c) 2015-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Class lookup for the GLOBAL / STACK_GLOBAL opcodes.
//!
//! The registry maps `(module, name)` pairs to values, usually callables
//! that construct the matching built-in container.  Callers may add their
//! own entries or install a fallback hook.  Without a fallback, unknown
//! names resolve to a plain class reference so that reducing over them
//! yields a generic object instead of failing.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, ErrorCode, Result};
use crate::typed::TypedData;
use crate::value::{Callable, ClassRef, Dict, Object, OrderedDict, Set, Value};

/// Fallback hook: `Ok(None)` means the hook declines the name, which
/// surfaces as `ClassNotFound`.
pub type ClassFallback<'a> = dyn FnMut(&str, &str) -> Result<Option<Value>> + 'a;

/// Lookup table consulted when the interpreter resolves a global.
pub struct ClassRegistry<'a> {
    entries: HashMap<(String, String), Value>,
    fallback: Option<Box<ClassFallback<'a>>>,
}

impl<'a> Default for ClassRegistry<'a> {
    fn default() -> Self {
        ClassRegistry::new()
    }
}

impl<'a> ClassRegistry<'a> {
    /// A registry preloaded with the built-in container constructors.
    pub fn new() -> ClassRegistry<'a> {
        let mut reg = ClassRegistry { entries: HashMap::new(), fallback: None };
        for module in ["__builtin__", "builtins"] {
            reg.register(module, "list", callable(ListClass));
            reg.register(module, "dict", callable(DictClass));
            reg.register(module, "set", callable(SetClass));
            reg.register(module, "frozenset", callable(FrozenSetClass));
            reg.register(module, "tuple", callable(TupleClass));
            reg.register(module, "bytes", callable(BytesClass));
            reg.register(module, "bytearray", callable(ByteArrayClass));
            reg.register(module, "object", callable(ObjectClass));
        }
        reg.register("collections", "OrderedDict", callable(OrderedDictClass));
        reg.register("_codecs", "encode", callable(CodecsEncode));
        reg.register("copy_reg", "_reconstructor", callable(Reconstructor));
        reg.register("copyreg", "_reconstructor", callable(Reconstructor));
        reg.register("array", "array", Value::Class(Rc::new(ClassRef::new("array", "array"))));
        reg.register("array", "_array_reconstructor", callable(ArrayReconstructor));
        reg
    }

    pub fn register(&mut self, module: impl Into<String>, name: impl Into<String>,
                    value: Value) {
        self.entries.insert((module.into(), name.into()), value);
    }

    /// Installs the hook consulted for names without an entry.
    pub fn set_fallback(&mut self, fallback: impl FnMut(&str, &str) -> Result<Option<Value>> + 'a) {
        self.fallback = Some(Box::new(fallback));
    }

    pub fn lookup(&mut self, module: &str, name: &str) -> Result<Value> {
        if let Some(value) = self.entries.get(&(module.to_string(), name.to_string())) {
            return Ok(value.clone());
        }
        match self.fallback {
            Some(ref mut fallback) => match fallback(module, name)? {
                Some(value) => Ok(value),
                None => Err(Error::Syntax(ErrorCode::ClassNotFound(module.into(), name.into()))),
            },
            None => Ok(Value::Class(Rc::new(ClassRef::new(module, name)))),
        }
    }
}

fn callable(c: impl Callable + 'static) -> Value {
    Value::Callable(Rc::new(c))
}

fn protocol<T>(msg: impl Into<String>) -> Result<T> {
    Err(Error::Syntax(ErrorCode::Protocol(msg.into())))
}

/// Items of any sequence-shaped value, cloned out.
fn sequence_items(value: &Value) -> Option<Vec<Value>> {
    match *value {
        Value::List(ref l) => Some(l.borrow().clone()),
        Value::Tuple(ref t) => Some(t.as_ref().clone()),
        Value::Set(ref s) => Some(s.borrow().items().to_vec()),
        Value::FrozenSet(ref s) => Some(s.items().to_vec()),
        _ => None,
    }
}

/// Key/value pairs from a mapping or a sequence of two-item sequences.
pub(crate) fn mapping_pairs(value: &Value) -> Option<Vec<(Value, Value)>> {
    match *value {
        Value::Dict(ref d) => Some(d.borrow().pairs().to_vec()),
        Value::OrderedDict(ref d) => Some(d.borrow().entries.pairs().to_vec()),
        _ => {
            let items = sequence_items(value)?;
            let mut pairs = Vec::with_capacity(items.len());
            for item in items {
                match item.tuple_items().or_else(|| item.list_items()) {
                    Some(kv) if kv.len() == 2 => {
                        let mut kv = kv.into_iter();
                        let k = kv.next().expect("length checked");
                        let v = kv.next().expect("length checked");
                        pairs.push((k, v));
                    }
                    _ => return None,
                }
            }
            Some(pairs)
        }
    }
}

struct ListClass;

impl Callable for ListClass {
    fn name(&self) -> &str { "builtins.list" }

    fn call(&self, args: Vec<Value>) -> Result<Value> {
        match args.len() {
            0 => Ok(Value::list(vec![])),
            1 => match sequence_items(&args[0]) {
                Some(items) => Ok(Value::list(items)),
                None => protocol(format!("list() argument: {}", args[0].type_name())),
            },
            n => protocol(format!("list() takes at most 1 argument, got {}", n)),
        }
    }
}

struct TupleClass;

impl Callable for TupleClass {
    fn name(&self) -> &str { "builtins.tuple" }

    fn call(&self, args: Vec<Value>) -> Result<Value> {
        match args.len() {
            0 => Ok(Value::tuple(vec![])),
            1 => match sequence_items(&args[0]) {
                Some(items) => Ok(Value::tuple(items)),
                None => protocol(format!("tuple() argument: {}", args[0].type_name())),
            },
            n => protocol(format!("tuple() takes at most 1 argument, got {}", n)),
        }
    }
}

struct DictClass;

impl Callable for DictClass {
    fn name(&self) -> &str { "builtins.dict" }

    fn call(&self, args: Vec<Value>) -> Result<Value> {
        let mut dict = Dict::new();
        match args.len() {
            0 => {}
            1 => match mapping_pairs(&args[0]) {
                Some(pairs) => for (k, v) in pairs {
                    dict.set(k, v)?;
                },
                None => return protocol(format!("dict() argument: {}", args[0].type_name())),
            },
            n => return protocol(format!("dict() takes at most 1 argument, got {}", n)),
        }
        Ok(Value::Dict(Rc::new(RefCell::new(dict))))
    }
}

struct OrderedDictClass;

impl Callable for OrderedDictClass {
    fn name(&self) -> &str { "collections.OrderedDict" }

    fn call(&self, args: Vec<Value>) -> Result<Value> {
        let mut dict = OrderedDict::new();
        match args.len() {
            0 => {}
            1 => match mapping_pairs(&args[0]) {
                Some(pairs) => for (k, v) in pairs {
                    dict.set(k, v)?;
                },
                None => return protocol(format!("OrderedDict() argument: {}",
                                                args[0].type_name())),
            },
            n => return protocol(format!("OrderedDict() takes at most 1 argument, got {}", n)),
        }
        Ok(Value::OrderedDict(Rc::new(RefCell::new(dict))))
    }
}

struct SetClass;

impl Callable for SetClass {
    fn name(&self) -> &str { "builtins.set" }

    fn call(&self, args: Vec<Value>) -> Result<Value> {
        let mut set = Set::new();
        match args.len() {
            0 => {}
            1 => match sequence_items(&args[0]) {
                Some(items) => for item in items {
                    set.add(item)?;
                },
                None => return protocol(format!("set() argument: {}", args[0].type_name())),
            },
            n => return protocol(format!("set() takes at most 1 argument, got {}", n)),
        }
        Ok(Value::Set(Rc::new(RefCell::new(set))))
    }
}

struct FrozenSetClass;

impl Callable for FrozenSetClass {
    fn name(&self) -> &str { "builtins.frozenset" }

    fn call(&self, args: Vec<Value>) -> Result<Value> {
        let mut set = Set::new();
        match args.len() {
            0 => {}
            1 => match sequence_items(&args[0]) {
                Some(items) => for item in items {
                    set.add(item)?;
                },
                None => return protocol(format!("frozenset() argument: {}",
                                                args[0].type_name())),
            },
            n => return protocol(format!("frozenset() takes at most 1 argument, got {}", n)),
        }
        Ok(Value::FrozenSet(Rc::new(set)))
    }
}

struct BytesClass;

impl Callable for BytesClass {
    fn name(&self) -> &str { "builtins.bytes" }

    fn call(&self, args: Vec<Value>) -> Result<Value> {
        match args.len() {
            0 => Ok(Value::Bytes(vec![])),
            1 => match args[0] {
                Value::Bytes(ref b) => Ok(Value::Bytes(b.clone())),
                ref arg => match sequence_items(arg) {
                    Some(items) => {
                        let mut bytes = Vec::with_capacity(items.len());
                        for item in items {
                            match item.as_i64() {
                                Some(b @ 0..=255) => bytes.push(b as u8),
                                _ => return protocol("bytes() item out of range"),
                            }
                        }
                        Ok(Value::Bytes(bytes))
                    }
                    None => protocol(format!("bytes() argument: {}", arg.type_name())),
                },
            },
            n => protocol(format!("bytes() takes at most 1 argument, got {}", n)),
        }
    }
}

struct ByteArrayClass;

impl Callable for ByteArrayClass {
    fn name(&self) -> &str { "builtins.bytearray" }

    fn call(&self, args: Vec<Value>) -> Result<Value> {
        let bytes = match BytesClass.call(args)? {
            Value::Bytes(b) => b,
            _ => unreachable!(),
        };
        Ok(Value::ByteArray(Rc::new(RefCell::new(bytes))))
    }
}

struct ObjectClass;

impl Callable for ObjectClass {
    fn name(&self) -> &str { "builtins.object" }

    fn call(&self, _args: Vec<Value>) -> Result<Value> {
        Ok(Value::Object(Rc::new(RefCell::new(Object::default()))))
    }
}

/// `_codecs.encode(text, encoding)`: byte strings from Python 2 producers
/// arrive as latin-1 re-encodings of a text string.
struct CodecsEncode;

impl Callable for CodecsEncode {
    fn name(&self) -> &str { "_codecs.encode" }

    fn call(&self, args: Vec<Value>) -> Result<Value> {
        if args.len() != 2 {
            return protocol(format!("encode() takes 2 arguments, got {}", args.len()));
        }
        let text = match args[0].as_str() {
            Some(s) => s,
            None => return protocol("encode() argument must be a string"),
        };
        match args[1].as_str() {
            Some("latin1") | Some("latin-1") => {
                let mut bytes = Vec::with_capacity(text.len());
                for ch in text.chars() {
                    if ch as u32 > 0xff {
                        return protocol("latin-1 encode: codepoint out of range");
                    }
                    bytes.push(ch as u8);
                }
                Ok(Value::Bytes(bytes))
            }
            Some("utf8") | Some("utf-8") => Ok(Value::Bytes(text.as_bytes().to_vec())),
            Some(other) => Err(Error::Syntax(ErrorCode::UnsupportedFeature(
                format!("encoding '{}'", other)))),
            None => protocol("encode() encoding must be a string"),
        }
    }
}

/// `copyreg._reconstructor(cls, base, state)`: the protocol-0 way of
/// instantiating plain objects.
struct Reconstructor;

impl Callable for Reconstructor {
    fn name(&self) -> &str { "copyreg._reconstructor" }

    fn call(&self, args: Vec<Value>) -> Result<Value> {
        if args.len() != 3 {
            return protocol(format!("_reconstructor takes 3 arguments, got {}", args.len()));
        }
        let mut args = args.into_iter();
        let cls = args.next().expect("length checked");
        let _base = args.next().expect("length checked");
        let state = args.next().expect("length checked");
        let class = match cls {
            Value::Class(ref c) => c.as_ref().clone(),
            ref other => return protocol(format!("_reconstructor class argument: {}",
                                                 other.type_name())),
        };
        let ctor_args = if state.is_none() { vec![] } else { vec![state] };
        Ok(Value::Object(Rc::new(RefCell::new(Object::new(class, ctor_args)))))
    }
}

/// Machine-format descriptors used by `array._array_reconstructor`, indexed
/// by the format code pickled alongside the payload: element size in bytes
/// and endianness.  Codes 18-21 are the UTF-16/UTF-32 text formats.
const ARRAY_DESCRIPTORS: [(usize, bool); 22] = [
    (1, false), // 0: UNSIGNED_INT8
    (1, false), // 1: SIGNED_INT8
    (2, false), // 2: UNSIGNED_INT16_LE
    (2, true),  // 3: UNSIGNED_INT16_BE
    (2, false), // 4: SIGNED_INT16_LE
    (2, true),  // 5: SIGNED_INT16_BE
    (4, false), // 6: UNSIGNED_INT32_LE
    (4, true),  // 7: UNSIGNED_INT32_BE
    (4, false), // 8: SIGNED_INT32_LE
    (4, true),  // 9: SIGNED_INT32_BE
    (8, false), // 10: UNSIGNED_INT64_LE
    (8, true),  // 11: UNSIGNED_INT64_BE
    (8, false), // 12: SIGNED_INT64_LE
    (8, true),  // 13: SIGNED_INT64_BE
    (4, false), // 14: IEEE_754_FLOAT_LE
    (4, true),  // 15: IEEE_754_FLOAT_BE
    (8, false), // 16: IEEE_754_DOUBLE_LE
    (8, true),  // 17: IEEE_754_DOUBLE_BE
    (2, false), // 18: UTF16_LE
    (2, true),  // 19: UTF16_BE
    (4, false), // 20: UTF32_LE
    (4, true),  // 21: UTF32_BE
];

/// `array._array_reconstructor(class, typecode, mformat, payload)`.
struct ArrayReconstructor;

impl Callable for ArrayReconstructor {
    fn name(&self) -> &str { "array._array_reconstructor" }

    fn call(&self, args: Vec<Value>) -> Result<Value> {
        if args.len() != 4 {
            return protocol(format!("_array_reconstructor takes 4 arguments, got {}",
                                    args.len()));
        }
        let typecode = match args[1].as_str() {
            Some(s) => s,
            None => return protocol("array typecode must be a string"),
        };
        let mformat = match args[2].as_usize() {
            Some(m) if m < ARRAY_DESCRIPTORS.len() => m,
            _ => return protocol("invalid array machine format code"),
        };
        let raw = match args[3].as_bytes() {
            Some(b) => b,
            None => return protocol("array payload must be bytes"),
        };
        let (size, big_endian) = ARRAY_DESCRIPTORS[mformat];
        if raw.len() % size != 0 {
            return protocol("array payload length not a multiple of the element size");
        }

        if typecode == "u" {
            return decode_text_array(mformat, raw);
        }

        let n = raw.len() / size;
        let chunks = raw.chunks_exact(size);
        let data = match typecode {
            "b" => TypedData::I8(raw.iter().map(|&b| b as i8).collect()),
            "B" => TypedData::U8(raw.to_vec()),
            "h" => TypedData::I16(read_chunks(chunks, n, big_endian,
                                              LittleEndian::read_i16, BigEndian::read_i16)),
            "H" => TypedData::U16(read_chunks(chunks, n, big_endian,
                                              LittleEndian::read_u16, BigEndian::read_u16)),
            "i" => TypedData::I32(read_chunks(chunks, n, big_endian,
                                              LittleEndian::read_i32, BigEndian::read_i32)),
            "I" => TypedData::U32(read_chunks(chunks, n, big_endian,
                                              LittleEndian::read_u32, BigEndian::read_u32)),
            "l" | "q" => TypedData::I64(read_chunks(chunks, n, big_endian,
                                                    LittleEndian::read_i64, BigEndian::read_i64)),
            "L" | "Q" => TypedData::U64(read_chunks(chunks, n, big_endian,
                                                    LittleEndian::read_u64, BigEndian::read_u64)),
            "f" => TypedData::F32(read_chunks(chunks, n, big_endian,
                                              LittleEndian::read_f32, BigEndian::read_f32)),
            "d" => TypedData::F64(read_chunks(chunks, n, big_endian,
                                              LittleEndian::read_f64, BigEndian::read_f64)),
            other => return protocol(format!("invalid array typecode '{}'", other)),
        };
        Ok(Value::Array(Rc::new(data)))
    }
}

fn read_chunks<'c, T>(chunks: std::slice::ChunksExact<'c, u8>, n: usize, big_endian: bool,
                      le: impl Fn(&[u8]) -> T, be: impl Fn(&[u8]) -> T) -> Vec<T> {
    let mut out = Vec::with_capacity(n);
    for chunk in chunks {
        out.push(if big_endian { be(chunk) } else { le(chunk) });
    }
    out
}

/// 'u' arrays carry text: UTF-16 for the 2-byte formats, UTF-32 for the
/// 4-byte ones.
fn decode_text_array(mformat: usize, raw: &[u8]) -> Result<Value> {
    let bad = || Error::Syntax(ErrorCode::Protocol("invalid text array payload".into()));
    match mformat {
        18 | 19 => {
            let units: Vec<u16> = raw.chunks_exact(2)
                .map(|c| if mformat == 19 { BigEndian::read_u16(c) }
                     else { LittleEndian::read_u16(c) })
                .collect();
            let text = char::decode_utf16(units.into_iter())
                .collect::<std::result::Result<String, _>>()
                .map_err(|_| bad())?;
            Ok(Value::String(text))
        }
        20 | 21 => {
            let mut text = String::with_capacity(raw.len() / 4);
            for chunk in raw.chunks_exact(4) {
                let unit = if mformat == 21 { BigEndian::read_u32(chunk) }
                           else { LittleEndian::read_u32(chunk) };
                text.push(char::from_u32(unit).ok_or_else(bad)?);
            }
            Ok(Value::String(text))
        }
        _ => protocol("text array requires a UTF-16 or UTF-32 machine format"),
    }
}
