// Copyright (c) 2015-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! # Pickle deserialization
//!
//! Note: Pickles are not a declarative format, but a program for a
//! stack-based VM.  Each value that is decoded is simply put on the stack,
//! and some operations pop items from the stack and construct new data with
//! them.
//!
//! The [`Unpickler`] interprets one such program into a [`Value`] graph.
//! Memoized values keep their identity: the same list referenced twice in
//! the stream comes out as the same shared handle, and cyclic graphs
//! (memoize-then-build) are preserved.
//!
//! A note on Python 2 `STRING` opcodes: their payload is written with the
//! producer's escape syntax already applied (`Café` arrives as the literal
//! characters `Caf\xc3\xa9`).  The payload is pushed verbatim, quotes
//! stripped; callers that want the decoded text must unescape it
//! themselves.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::mem;
use std::rc::Rc;
use std::str;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::de;
use tracing::debug;

use crate::class::{mapping_pairs, ClassRegistry};
use crate::consts::*;
use crate::error::{Error, ErrorCode, Result};
use crate::value::{Dict, Object, Set, Value};
use crate::value_impls::from_value;

/// Highest pickle protocol understood by the interpreter.
const MAX_PROTOCOL: u8 = 5;

struct OffsetReader<R> {
    rdr: R,
    pos: usize,
}

impl<R: Read> OffsetReader<R> {
    fn new(rdr: R) -> OffsetReader<R> {
        OffsetReader { rdr, pos: 0 }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf)?;
        Ok(buf[0])
    }

    fn read_bytes(&mut self, n: u64) -> Result<Vec<u8>> {
        // Read in bounded chunks so that a bogus length prefix runs into
        // UnexpectedEnd instead of a giant allocation.
        const CHUNK: u64 = 1 << 16;
        let mut buf = Vec::with_capacity(n.min(CHUNK) as usize);
        let mut remaining = n;
        while remaining > 0 {
            let take = remaining.min(CHUNK) as usize;
            let start = buf.len();
            buf.resize(start + take, 0);
            self.fill(&mut buf[start..])?;
            remaining -= take as u64;
        }
        Ok(buf)
    }

    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(16);
        loop {
            match self.read_byte()? {
                b'\n' => {
                    if result.last() == Some(&b'\r') { result.pop(); }
                    return Ok(result);
                }
                ch => result.push(ch),
            }
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.rdr.read_exact(buf) {
            Ok(()) => {
                self.pos += buf.len();
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof =>
                Err(Error::Eval(ErrorCode::UnexpectedEnd, self.pos)),
            Err(err) => Err(Error::Io(err)),
        }
    }
}

/// Hook resolving persistent ids (PERSID / BINPERSID) to values.
pub type PersistentLoad<'a> = dyn FnMut(Value) -> Result<Value> + 'a;

/// Hook yielding the next out-of-band buffer (NEXT_BUFFER).
pub type BufferSource<'a> = dyn FnMut() -> Result<Value> + 'a;

/// Decodes pickle streams into Values.
///
/// One [`load`](Unpickler::load) call consumes exactly one pickle frame and
/// leaves the reader positioned after its STOP opcode, so concatenated
/// pickles can be read back to back.
pub struct Unpickler<'a, R: Read> {
    rdr: OffsetReader<R>,
    stack: Vec<Value>,
    stacks: Vec<Vec<Value>>,
    memo: BTreeMap<u32, Value>,
    registry: ClassRegistry<'a>,
    persistent_load: Option<Box<PersistentLoad<'a>>>,
    buffer_source: Option<Box<BufferSource<'a>>>,
    proto: u8,
}

impl<'a, R: Read> Unpickler<'a, R> {
    pub fn new(rdr: R) -> Unpickler<'a, R> {
        Unpickler::with_registry(rdr, ClassRegistry::new())
    }

    pub fn with_registry(rdr: R, registry: ClassRegistry<'a>) -> Unpickler<'a, R> {
        Unpickler {
            rdr: OffsetReader::new(rdr),
            stack: Vec::with_capacity(128),
            stacks: Vec::with_capacity(16),
            memo: BTreeMap::new(),
            registry,
            persistent_load: None,
            buffer_source: None,
            proto: 0,
        }
    }

    /// Installs the persistent-id resolver.  Without one, PERSID and
    /// BINPERSID fail.
    pub fn set_persistent_load(&mut self, f: impl FnMut(Value) -> Result<Value> + 'a) {
        self.persistent_load = Some(Box::new(f));
    }

    /// Installs the out-of-band buffer source.  Without one, NEXT_BUFFER
    /// fails.
    pub fn set_buffer_source(&mut self, f: impl FnMut() -> Result<Value> + 'a) {
        self.buffer_source = Some(Box::new(f));
    }

    pub fn registry_mut(&mut self) -> &mut ClassRegistry<'a> {
        &mut self.registry
    }

    /// Protocol version recorded by the last PROTO opcode (0 if absent).
    pub fn proto(&self) -> u8 {
        self.proto
    }

    /// Checks that the input is exhausted.
    pub fn end(&mut self) -> Result<()> {
        match self.rdr.read_byte() {
            Err(Error::Eval(ErrorCode::UnexpectedEnd, _)) => Ok(()),
            Ok(_) => self.error(ErrorCode::TrailingBytes),
            Err(err) => Err(err),
        }
    }

    // Number of values left behind on the stack; zero after any
    // well-formed pickle.
    #[cfg(test)]
    pub(crate) fn residual_stack_len(&self) -> usize {
        self.stack.len() + self.stacks.iter().map(Vec::len).sum::<usize>()
    }

    /// Reads one pickle frame and returns the value on top of the stack
    /// when STOP is reached.
    pub fn load(&mut self) -> Result<Value> {
        self.stack.clear();
        self.stacks.clear();
        self.memo.clear();
        self.proto = 0;
        loop {
            match self.rdr.read_byte()? {
                // Specials
                STOP => {
                    let value = self.pop()?;
                    debug!(proto = self.proto, offset = self.rdr.pos(), "pickle loaded");
                    return Ok(value);
                }
                POP => {
                    if self.stack.is_empty() {
                        self.pop_mark()?;
                    } else {
                        self.pop()?;
                    }
                }
                POP_MARK => { self.pop_mark()?; }
                DUP => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }
                MARK => {
                    let stack = mem::replace(&mut self.stack, Vec::with_capacity(128));
                    self.stacks.push(stack);
                }
                PROTO => {
                    let proto = self.rdr.read_byte()?;
                    if proto > MAX_PROTOCOL {
                        return self.error(ErrorCode::Protocol(
                            format!("unsupported protocol {}", proto)));
                    }
                    self.proto = proto;
                }
                FRAME => {
                    // Framing is advisory; gobble up the length.
                    self.rdr.read_bytes(8)?;
                }

                // Memo
                PUT => {
                    let key = self.parse_memo_key()?;
                    let top = self.top()?.clone();
                    self.memo.insert(key, top);
                }
                BINPUT => {
                    let key = self.rdr.read_byte()? as u32;
                    let top = self.top()?.clone();
                    self.memo.insert(key, top);
                }
                LONG_BINPUT => {
                    let bytes = self.rdr.read_bytes(4)?;
                    let top = self.top()?.clone();
                    self.memo.insert(LittleEndian::read_u32(&bytes), top);
                }
                MEMOIZE => {
                    let key = self.memo.len() as u32;
                    let top = self.top()?.clone();
                    self.memo.insert(key, top);
                }
                GET => {
                    let key = self.parse_memo_key()?;
                    self.push_memo(key)?;
                }
                BINGET => {
                    let key = self.rdr.read_byte()? as u32;
                    self.push_memo(key)?;
                }
                LONG_BINGET => {
                    let bytes = self.rdr.read_bytes(4)?;
                    let key = LittleEndian::read_u32(&bytes);
                    self.push_memo(key)?;
                }

                // Singletons
                NONE => self.stack.push(Value::None),
                NEWFALSE => self.stack.push(Value::Bool(false)),
                NEWTRUE => self.stack.push(Value::Bool(true)),

                // ASCII-formatted numbers
                INT => {
                    let line = self.rdr.read_line()?;
                    // Protocol 0 way of spelling true/false
                    if line == b"00" {
                        self.stack.push(Value::Bool(false));
                    } else if line == b"01" {
                        self.stack.push(Value::Bool(true));
                    } else {
                        let value = match str::from_utf8(&line).unwrap_or("").parse::<i64>() {
                            Ok(i) => Value::I64(i),
                            Err(_) => match BigInt::parse_bytes(&line, 10) {
                                Some(i) => fit_int(i),
                                None => return self.error(ErrorCode::InvalidLiteral(line)),
                            },
                        };
                        self.stack.push(value);
                    }
                }
                LONG => {
                    let mut line = self.rdr.read_line()?;
                    // Remove "L" suffix.
                    if line.last() == Some(&b'L') { line.pop(); }
                    match BigInt::parse_bytes(&line, 10) {
                        Some(i) => self.stack.push(fit_int(i)),
                        None => return self.error(ErrorCode::InvalidLiteral(line)),
                    }
                }
                FLOAT => {
                    let line = self.rdr.read_line()?;
                    match str::from_utf8(&line).unwrap_or("").parse::<f64>() {
                        Ok(f) => self.stack.push(Value::F64(f)),
                        Err(_) => return self.error(ErrorCode::InvalidLiteral(line)),
                    }
                }

                // Binary-coded numbers
                BINFLOAT => {
                    let bytes = self.rdr.read_bytes(8)?;
                    self.stack.push(Value::F64(BigEndian::read_f64(&bytes)));
                }
                BININT => {
                    let bytes = self.rdr.read_bytes(4)?;
                    self.stack.push(Value::I64(LittleEndian::read_i32(&bytes) as i64));
                }
                BININT1 => {
                    let byte = self.rdr.read_byte()?;
                    self.stack.push(Value::I64(byte as i64));
                }
                BININT2 => {
                    let bytes = self.rdr.read_bytes(2)?;
                    self.stack.push(Value::I64(LittleEndian::read_u16(&bytes) as i64));
                }

                // Length-prefixed longs
                LONG1 => {
                    let bytes = self.read_u8_prefixed_bytes()?;
                    self.stack.push(decode_long(bytes));
                }
                LONG4 => {
                    let bytes = self.read_i32_prefixed_bytes()?;
                    self.stack.push(decode_long(bytes));
                }

                // Until-EOL strings
                STRING => {
                    let line = self.rdr.read_line()?;
                    // Remove quotes; the escaped payload is pushed verbatim
                    // (see the module docs).
                    let slice = if line.len() >= 2 && line[0] == line[line.len() - 1] &&
                        (line[0] == b'"' || line[0] == b'\'') {
                            line[1..line.len() - 1].to_vec()
                        } else { line };
                    let decoded = decode_string(slice);
                    self.stack.push(decoded);
                }
                UNICODE => {
                    let line = self.rdr.read_line()?;
                    let string = self.decode_escaped_unicode(&line)?;
                    self.stack.push(string);
                }

                // Length-prefixed (byte)strings
                SHORT_BINBYTES => {
                    let bytes = self.read_u8_prefixed_bytes()?;
                    self.stack.push(Value::Bytes(bytes));
                }
                BINBYTES => {
                    let bytes = self.read_u32_prefixed_bytes()?;
                    self.stack.push(Value::Bytes(bytes));
                }
                BINBYTES8 => {
                    let bytes = self.read_u64_prefixed_bytes()?;
                    self.stack.push(Value::Bytes(bytes));
                }
                BYTEARRAY8 => {
                    let bytes = self.read_u64_prefixed_bytes()?;
                    self.stack.push(Value::ByteArray(Rc::new(bytes.into())));
                }
                SHORT_BINSTRING => {
                    let string = self.read_u8_prefixed_bytes()?;
                    self.stack.push(decode_string(string));
                }
                BINSTRING => {
                    let string = self.read_i32_prefixed_bytes()?;
                    self.stack.push(decode_string(string));
                }
                SHORT_BINUNICODE => {
                    let string = self.read_u8_prefixed_bytes()?;
                    let decoded = self.decode_unicode(string)?;
                    self.stack.push(decoded);
                }
                BINUNICODE => {
                    let string = self.read_u32_prefixed_bytes()?;
                    let decoded = self.decode_unicode(string)?;
                    self.stack.push(decoded);
                }
                BINUNICODE8 => {
                    let string = self.read_u64_prefixed_bytes()?;
                    let decoded = self.decode_unicode(string)?;
                    self.stack.push(decoded);
                }

                // Containers
                EMPTY_TUPLE => self.stack.push(Value::tuple(vec![])),
                TUPLE1 => {
                    let item = self.pop()?;
                    self.stack.push(Value::tuple(vec![item]));
                }
                TUPLE2 => {
                    let item2 = self.pop()?;
                    let item1 = self.pop()?;
                    self.stack.push(Value::tuple(vec![item1, item2]));
                }
                TUPLE3 => {
                    let item3 = self.pop()?;
                    let item2 = self.pop()?;
                    let item1 = self.pop()?;
                    self.stack.push(Value::tuple(vec![item1, item2, item3]));
                }
                TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::tuple(items));
                }
                EMPTY_LIST => self.stack.push(Value::list(vec![])),
                LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::list(items));
                }
                APPEND => {
                    let value = self.pop()?;
                    let top = self.top()?.clone();
                    match top {
                        Value::List(list) => list.borrow_mut().push(value),
                        other => return self.error(ErrorCode::InvalidStackTop(
                            "list", other.type_name().into())),
                    }
                }
                APPENDS => {
                    let items = self.pop_mark()?;
                    let top = self.top()?.clone();
                    match top {
                        Value::List(list) => list.borrow_mut().extend(items),
                        other => return self.error(ErrorCode::InvalidStackTop(
                            "list", other.type_name().into())),
                    }
                }
                EMPTY_DICT => self.stack.push(Value::Dict(Rc::new(Default::default()))),
                DICT => {
                    let items = self.pop_mark()?;
                    if items.len() % 2 != 0 {
                        return self.error(ErrorCode::Protocol(
                            "odd number of items for dict".into()));
                    }
                    let dict = Rc::new(RefCell::new(Dict::new()));
                    {
                        let mut dict = dict.borrow_mut();
                        let mut iter = items.into_iter();
                        while let Some(key) = iter.next() {
                            let value = iter.next().expect("even number of items");
                            self.wrap(dict.set(key, value))?;
                        }
                    }
                    self.stack.push(Value::Dict(dict));
                }
                SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.set_item(vec![(key, value)])?;
                }
                SETITEMS => {
                    let items = self.pop_mark()?;
                    if items.len() % 2 != 0 {
                        return self.error(ErrorCode::Protocol(
                            "odd number of items for dict".into()));
                    }
                    let mut pairs = Vec::with_capacity(items.len() / 2);
                    let mut iter = items.into_iter();
                    while let Some(key) = iter.next() {
                        let value = iter.next().expect("even number of items");
                        pairs.push((key, value));
                    }
                    self.set_item(pairs)?;
                }
                EMPTY_SET => self.stack.push(Value::Set(Rc::new(Default::default()))),
                ADDITEMS => {
                    let items = self.pop_mark()?;
                    let top = self.top()?.clone();
                    match top {
                        Value::Set(set) => {
                            let mut set = set.borrow_mut();
                            for item in items {
                                self.wrap(set.add(item))?;
                            }
                        }
                        other => return self.error(ErrorCode::InvalidStackTop(
                            "set", other.type_name().into())),
                    }
                }
                FROZENSET => {
                    let items = self.pop_mark()?;
                    let mut set = Set::new();
                    for item in items {
                        self.wrap(set.add(item))?;
                    }
                    self.stack.push(Value::FrozenSet(Rc::new(set)));
                }

                // Globals and object construction
                GLOBAL => {
                    let module = self.read_line_string()?;
                    let name = self.read_line_string()?;
                    let value = self.find_class(&module, &name)?;
                    self.stack.push(value);
                }
                STACK_GLOBAL => {
                    let name = match self.pop()? {
                        Value::String(s) => s,
                        other => return self.error(ErrorCode::InvalidStackTop(
                            "str", other.type_name().into())),
                    };
                    let module = match self.pop()? {
                        Value::String(s) => s,
                        other => return self.error(ErrorCode::InvalidStackTop(
                            "str", other.type_name().into())),
                    };
                    let value = self.find_class(&module, &name)?;
                    self.stack.push(value);
                }
                REDUCE => {
                    let args = self.pop_tuple_args()?;
                    let callable = self.pop()?;
                    let value = self.call_value(callable, args)?;
                    self.stack.push(value);
                }
                NEWOBJ => {
                    let args = self.pop_tuple_args()?;
                    let class = self.pop()?;
                    let value = self.call_value(class, args)?;
                    self.stack.push(value);
                }
                NEWOBJ_EX => {
                    let kwargs = self.pop()?;
                    match kwargs {
                        Value::Dict(ref d) if d.borrow().is_empty() => {}
                        _ => return self.error(ErrorCode::Protocol(
                            "NEWOBJ_EX with keyword arguments".into())),
                    }
                    let args = self.pop_tuple_args()?;
                    let class = self.pop()?;
                    let value = self.call_value(class, args)?;
                    self.stack.push(value);
                }
                OBJ => {
                    let mut frame = self.pop_mark()?;
                    if frame.is_empty() {
                        return self.error(ErrorCode::StackUnderflow);
                    }
                    let args = frame.split_off(1);
                    let class = frame.pop().expect("frame not empty");
                    let value = self.call_value(class, args)?;
                    self.stack.push(value);
                }
                INST => {
                    let module = self.read_line_string()?;
                    let name = self.read_line_string()?;
                    let args = self.pop_mark()?;
                    let class = self.find_class(&module, &name)?;
                    let value = self.call_value(class, args)?;
                    self.stack.push(value);
                }
                BUILD => {
                    let state = self.pop()?;
                    self.build(state)?;
                }

                // Persistence
                PERSID => {
                    let line = self.rdr.read_line()?;
                    let id = decode_string(line);
                    self.persistent(id)?;
                }
                BINPERSID => {
                    let id = self.pop()?;
                    self.persistent(id)?;
                }

                // Out-of-band buffers
                NEXT_BUFFER => {
                    let pos = self.rdr.pos();
                    match self.buffer_source {
                        Some(ref mut source) => {
                            let value = source().map_err(|e| wrap_at(e, pos))?;
                            self.stack.push(value);
                        }
                        None => return self.error(ErrorCode::UnsupportedFeature(
                            "out-of-band buffer without a buffer source".into())),
                    }
                }
                READONLY_BUFFER => {
                    // Acknowledge only; buffers are returned as immutable
                    // byte strings anyway.
                    self.top()?;
                }

                code => return self.error(ErrorCode::UnknownOpcode(code)),
            }
        }
    }

    fn pop(&mut self) -> Result<Value> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => self.error(ErrorCode::StackUnderflow),
        }
    }

    fn top(&self) -> Result<&Value> {
        match self.stack.last() {
            Some(value) => Ok(value),
            None => Err(Error::Eval(ErrorCode::StackUnderflow, self.rdr.pos())),
        }
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        match self.stacks.pop() {
            Some(new) => Ok(mem::replace(&mut self.stack, new)),
            None => self.error(ErrorCode::NoMark),
        }
    }

    fn push_memo(&mut self, key: u32) -> Result<()> {
        match self.memo.get(&key) {
            Some(value) => {
                let value = value.clone();
                self.stack.push(value);
                Ok(())
            }
            None => self.error(ErrorCode::MemoMiss(key)),
        }
    }

    fn parse_memo_key(&mut self) -> Result<u32> {
        let line = self.rdr.read_line()?;
        match str::from_utf8(&line).unwrap_or("").parse::<u32>() {
            Ok(key) => Ok(key),
            Err(_) => self.error(ErrorCode::InvalidLiteral(line)),
        }
    }

    fn pop_tuple_args(&mut self) -> Result<Vec<Value>> {
        match self.pop()? {
            Value::Tuple(items) => Ok(items.as_ref().clone()),
            other => self.error(ErrorCode::InvalidStackTop("tuple", other.type_name().into())),
        }
    }

    fn read_line_string(&mut self) -> Result<String> {
        let line = self.rdr.read_line()?;
        match String::from_utf8(line) {
            Ok(s) => Ok(s),
            Err(_) => self.error(ErrorCode::StringNotUtf8),
        }
    }

    fn find_class(&mut self, module: &str, name: &str) -> Result<Value> {
        let pos = self.rdr.pos();
        self.registry.lookup(module, name).map_err(|e| wrap_at(e, pos))
    }

    /// Invokes a resolved class or callable with the given arguments.
    /// Plain class references produce generic objects carrying the
    /// arguments verbatim.
    fn call_value(&mut self, callable: Value, args: Vec<Value>) -> Result<Value> {
        let pos = self.rdr.pos();
        match callable {
            Value::Callable(c) => c.call(args).map_err(|e| wrap_at(e, pos)),
            Value::Class(c) => Ok(Value::Object(Rc::new(RefCell::new(
                Object::new(c.as_ref().clone(), args))))),
            other => self.error(ErrorCode::InvalidStackTop("callable", other.type_name().into())),
        }
    }

    fn set_item(&mut self, pairs: Vec<(Value, Value)>) -> Result<()> {
        let top = self.top()?.clone();
        match top {
            Value::Dict(dict) => {
                let mut dict = dict.borrow_mut();
                for (key, value) in pairs {
                    self.wrap(dict.set(key, value))?;
                }
            }
            Value::OrderedDict(dict) => {
                let mut dict = dict.borrow_mut();
                for (key, value) in pairs {
                    self.wrap(dict.set(key, value))?;
                }
            }
            other => return self.error(ErrorCode::InvalidStackTop(
                "dict", other.type_name().into())),
        }
        Ok(())
    }

    /// Applies BUILD state to the object below.  The accepted shapes are,
    /// in capability order: a mapping (attributes), a two-element sequence
    /// of attribute state plus slot mapping, a two-element
    /// (list-items, dict-items) sequence for container targets, and an
    /// arbitrary state object stored verbatim.
    fn build(&mut self, state: Value) -> Result<()> {
        let target = self.top()?.clone();
        match target {
            Value::Object(obj) => {
                match state {
                    ref mapping if mapping_pairs_strict(mapping).is_some() => {
                        let pairs = mapping_pairs_strict(mapping).expect("just checked");
                        let mut obj = obj.borrow_mut();
                        for (key, value) in pairs {
                            self.wrap(obj.attrs.set(key, value))?;
                        }
                    }
                    Value::Tuple(ref items) if items.len() == 2
                        && is_mapping_or_none(&items[0])
                        && is_mapping_or_none(&items[1]) =>
                    {
                        let mut obj = obj.borrow_mut();
                        for part in items.iter() {
                            if let Some(pairs) = mapping_pairs_strict(part) {
                                for (key, value) in pairs {
                                    self.wrap(obj.attrs.set(key, value))?;
                                }
                            }
                        }
                    }
                    other => obj.borrow_mut().state = Some(other),
                }
            }
            Value::OrderedDict(dict) => {
                match mapping_pairs_strict(&state) {
                    Some(pairs) => {
                        let mut dict = dict.borrow_mut();
                        for (key, value) in pairs {
                            self.wrap(dict.attrs.set(key, value))?;
                        }
                    }
                    None => return self.error(ErrorCode::Protocol(
                        "OrderedDict state must be a mapping".into())),
                }
            }
            Value::List(list) => {
                // (list-items, dict-items) shape for list-like targets.
                match build_items_pair(&state) {
                    Some((Some(items), None)) => list.borrow_mut().extend(items),
                    _ => return self.error(ErrorCode::Protocol(
                        "list state must be a (items, None) pair".into())),
                }
            }
            Value::Dict(dict) => {
                match build_items_pair(&state) {
                    Some((None, Some(pairs))) => {
                        let mut dict = dict.borrow_mut();
                        for (key, value) in pairs {
                            self.wrap(dict.set(key, value))?;
                        }
                    }
                    _ => return self.error(ErrorCode::Protocol(
                        "dict state must be a (None, items) pair".into())),
                }
            }
            other => return self.error(ErrorCode::InvalidStackTop(
                "buildable object", other.type_name().into())),
        }
        Ok(())
    }

    fn persistent(&mut self, id: Value) -> Result<()> {
        let pos = self.rdr.pos();
        match self.persistent_load {
            Some(ref mut resolver) => {
                let value = resolver(id).map_err(|e| wrap_at(e, pos))?;
                self.stack.push(value);
                Ok(())
            }
            None => self.error(ErrorCode::UnsupportedFeature(
                "persistent id without a resolver".into())),
        }
    }

    fn decode_unicode(&self, string: Vec<u8>) -> Result<Value> {
        match String::from_utf8(string) {
            Ok(v) => Ok(Value::String(v)),
            Err(_) => self.error(ErrorCode::StringNotUtf8),
        }
    }

    fn decode_escaped_unicode(&self, s: &[u8]) -> Result<Value> {
        // These are encoded with "raw-unicode-escape", which only knows
        // the \uXXXX and \UYYYYYYYY escapes.  The backslash is escaped
        // in this way, too.
        let mut result = String::with_capacity(s.len());
        let mut iter = s.iter();
        while let Some(&b) = iter.next() {
            match b {
                b'\\' => {
                    let nescape = match iter.next() {
                        Some(&b'u') => 4,
                        Some(&b'U') => 8,
                        _ => return self.error(ErrorCode::InvalidLiteral(s.into())),
                    };
                    let mut accum = 0;
                    for _ in 0..nescape {
                        accum *= 16;
                        match iter.next().and_then(|&ch| (ch as char).to_digit(16)) {
                            Some(v) => accum += v,
                            None => return self.error(ErrorCode::InvalidLiteral(s.into())),
                        }
                    }
                    match char::from_u32(accum) {
                        Some(v) => result.push(v),
                        None => return self.error(ErrorCode::InvalidLiteral(s.into())),
                    }
                }
                _ => result.push(b as char),
            }
        }
        Ok(Value::String(result))
    }

    fn read_i32_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.rdr.read_bytes(4)?;
        match LittleEndian::read_i32(&lenbytes) {
            0 => Ok(vec![]),
            l if l < 0 => self.error(ErrorCode::NegativeLength),
            l => self.rdr.read_bytes(l as u64),
        }
    }

    fn read_u64_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.rdr.read_bytes(8)?;
        self.rdr.read_bytes(LittleEndian::read_u64(&lenbytes))
    }

    fn read_u32_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.rdr.read_bytes(4)?;
        self.rdr.read_bytes(LittleEndian::read_u32(&lenbytes) as u64)
    }

    fn read_u8_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbyte = self.rdr.read_byte()?;
        self.rdr.read_bytes(lenbyte as u64)
    }

    /// Attaches the current offset to an offset-less error.
    fn wrap<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|e| wrap_at(e, self.rdr.pos()))
    }

    fn error<T>(&self, reason: ErrorCode) -> Result<T> {
        Err(Error::Eval(reason, self.rdr.pos()))
    }
}

fn wrap_at(err: Error, pos: usize) -> Error {
    match err {
        Error::Syntax(code) => Error::Eval(code, pos),
        other => other,
    }
}

/// Demotes a big integer to a machine integer when it fits.
fn fit_int(value: BigInt) -> Value {
    match value.to_i64() {
        Some(i) => Value::I64(i),
        None => Value::Int(value),
    }
}

/// Decodes a two's-complement little-endian integer; the empty payload is
/// zero.
fn decode_long(bytes: Vec<u8>) -> Value {
    if bytes.is_empty() {
        return Value::I64(0);
    }
    fit_int(BigInt::from_signed_bytes_le(&bytes))
}

/// Raw-byte strings are pushed as text when they happen to be UTF-8, and as
/// byte strings otherwise.
fn decode_string(bytes: Vec<u8>) -> Value {
    match String::from_utf8(bytes) {
        Ok(s) => Value::String(s),
        Err(err) => Value::Bytes(err.into_bytes()),
    }
}

/// Pairs of a dict-shaped value only (no pair-list fallback).
fn mapping_pairs_strict(value: &Value) -> Option<Vec<(Value, Value)>> {
    match *value {
        Value::Dict(_) | Value::OrderedDict(_) => mapping_pairs(value),
        _ => None,
    }
}

fn is_mapping_or_none(value: &Value) -> bool {
    value.is_none() || matches!(value, Value::Dict(_) | Value::OrderedDict(_))
}

/// Decomposes a BUILD state of the (list-items, dict-items) shape.
#[allow(clippy::type_complexity)]
fn build_items_pair(state: &Value) -> Option<(Option<Vec<Value>>, Option<Vec<(Value, Value)>>)> {
    let items = state.tuple_items()?;
    if items.len() != 2 {
        return None;
    }
    let list_items = match items[0] {
        Value::None => None,
        ref v => Some(v.list_items()?),
    };
    let dict_items = match items[1] {
        Value::None => None,
        ref v => Some(mapping_pairs(v)?),
    };
    Some((list_items, dict_items))
}

/// Decodes a value from a `std::io::Read`, requiring that the input
/// contains exactly one pickle.
pub fn value_from_reader<R: Read>(rdr: R) -> Result<Value> {
    let mut up = Unpickler::new(rdr);
    let value = up.load()?;
    // Make sure the whole stream has been consumed.
    up.end()?;
    Ok(value)
}

/// Decodes a value from a byte slice `&[u8]`.
pub fn value_from_slice(data: &[u8]) -> Result<Value> {
    value_from_reader(data)
}

/// Decodes a value from a `std::io::Read` into any serde-supported type.
pub fn from_reader<R: Read, T: de::DeserializeOwned>(rdr: R) -> Result<T> {
    from_value(value_from_reader(rdr)?)
}

/// Decodes a value from a byte slice `&[u8]` into any serde-supported type.
pub fn from_slice<T: de::DeserializeOwned>(data: &[u8]) -> Result<T> {
    from_value(value_from_slice(data)?)
}
