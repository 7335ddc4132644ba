// Copyright (c) 2015-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Deserializer implementation for `value::Value`.
//!
//! This lets a decoded value graph be turned into ordinary Rust data
//! structures with serde.  Values without a counterpart in the serde data
//! model (class references, generic objects, callables, storages, tensors)
//! fail with a structure error.  The graph must be acyclic; cyclic graphs
//! are only representable at the `Value` level.

use std::vec;

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::de;
use serde::forward_to_deserialize_any;

use crate::error::{Error, ErrorCode, Result};
use crate::typed::TypedData;
use crate::value::Value;

/// Deserializes a decoded value into any serde-supported value.
pub struct Deserializer {
    value: Option<Value>,
}

impl Deserializer {
    pub fn new(value: Value) -> Deserializer {
        Deserializer { value: Some(value) }
    }
}

fn structure(msg: impl Into<String>) -> Error {
    Error::Syntax(ErrorCode::Structure(msg.into()))
}

impl<'de> de::Deserializer<'de> for Deserializer {
    type Error = Error;

    fn deserialize_any<V>(mut self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        let value = match self.value.take() {
            Some(value) => value,
            None => return Err(structure("value already consumed")),
        };

        match value {
            Value::None => visitor.visit_unit(),
            Value::Bool(b) => visitor.visit_bool(b),
            Value::I64(i) => visitor.visit_i64(i),
            Value::Int(i) => {
                if let Some(v) = i.to_i64() {
                    visitor.visit_i64(v)
                } else if let Some(v) = i.to_u64() {
                    visitor.visit_u64(v)
                } else {
                    Err(structure("integer too large"))
                }
            }
            Value::F64(f) => visitor.visit_f64(f),
            Value::String(s) => visitor.visit_string(s),
            Value::Bytes(b) => visitor.visit_byte_buf(b),
            Value::ByteArray(b) => visitor.visit_byte_buf(b.borrow().clone()),
            Value::List(l) => {
                let items = l.borrow().clone();
                visit_seq(items, visitor)
            }
            Value::Tuple(t) => visit_seq(t.as_ref().clone(), visitor),
            Value::Set(s) => {
                let items = s.borrow().items().to_vec();
                visit_seq(items, visitor)
            }
            Value::FrozenSet(s) => visit_seq(s.items().to_vec(), visitor),
            Value::Array(a) => visit_seq(array_values(&a), visitor),
            Value::Dict(d) => {
                let pairs = d.borrow().pairs().to_vec();
                visit_map(pairs, visitor)
            }
            Value::OrderedDict(d) => {
                let pairs = d.borrow().entries.pairs().to_vec();
                visit_map(pairs, visitor)
            }
            other => Err(structure(format!("cannot deserialize {}", other.type_name()))),
        }
    }

    #[inline]
    fn deserialize_option<V>(mut self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        match self.value.take() {
            Some(Value::None) => visitor.visit_none(),
            Some(value) => visitor.visit_some(Deserializer::new(value)),
            None => Err(structure("value already consumed")),
        }
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct newtype_struct seq tuple tuple_struct
        map struct enum identifier ignored_any
    }
}

fn visit_seq<'de, V>(items: Vec<Value>, visitor: V) -> Result<V::Value>
    where V: de::Visitor<'de>
{
    visitor.visit_seq(SeqDeserializer { iter: items.into_iter() })
}

fn visit_map<'de, V>(pairs: Vec<(Value, Value)>, visitor: V) -> Result<V::Value>
    where V: de::Visitor<'de>
{
    visitor.visit_map(MapDeserializer { iter: pairs.into_iter(), value: None })
}

fn array_values(data: &TypedData) -> Vec<Value> {
    match *data {
        TypedData::I8(ref v) => v.iter().map(|&x| Value::I64(x as i64)).collect(),
        TypedData::U8(ref v) => v.iter().map(|&x| Value::I64(x as i64)).collect(),
        TypedData::I16(ref v) => v.iter().map(|&x| Value::I64(x as i64)).collect(),
        TypedData::U16(ref v) => v.iter().map(|&x| Value::I64(x as i64)).collect(),
        TypedData::I32(ref v) => v.iter().map(|&x| Value::I64(x as i64)).collect(),
        TypedData::U32(ref v) => v.iter().map(|&x| Value::I64(x as i64)).collect(),
        TypedData::I64(ref v) => v.iter().map(|&x| Value::I64(x)).collect(),
        TypedData::U64(ref v) => v.iter().map(|&x| match i64::try_from(x) {
            Ok(i) => Value::I64(i),
            Err(_) => Value::Int(BigInt::from(x)),
        }).collect(),
        TypedData::F32(ref v) => v.iter().map(|&x| Value::F64(x as f64)).collect(),
        TypedData::F64(ref v) => v.iter().map(|&x| Value::F64(x)).collect(),
        TypedData::Bool(ref v) => v.iter().map(|&x| Value::Bool(x)).collect(),
    }
}

struct SeqDeserializer {
    iter: vec::IntoIter<Value>,
}

impl<'de> de::SeqAccess<'de> for SeqDeserializer {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
        where T: de::DeserializeSeed<'de>
    {
        match self.iter.next() {
            Some(value) => seed.deserialize(Deserializer::new(value)).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct MapDeserializer {
    iter: vec::IntoIter<(Value, Value)>,
    value: Option<Value>,
}

impl<'de> de::MapAccess<'de> for MapDeserializer {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
        where K: de::DeserializeSeed<'de>
    {
        match self.iter.next() {
            Some((key, value)) => {
                self.value = Some(value);
                seed.deserialize(Deserializer::new(key)).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
        where V: de::DeserializeSeed<'de>
    {
        match self.value.take() {
            Some(value) => seed.deserialize(Deserializer::new(value)),
            None => Err(structure("map value missing")),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

/// Deserializes a decoded [`Value`] into any serde-supported type.
pub fn from_value<T: de::DeserializeOwned>(value: Value) -> Result<T> {
    T::deserialize(Deserializer::new(value))
}
