// Copyright (c) 2015-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Typed numeric arrays and the element decoders that fill them.
//!
//! The decoders read a little-endian payload of a known element count.
//! Half and bfloat16 elements are widened to `f32` on the way in.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian};

use crate::f16;
use crate::read::LimitedBufferReader;

/// Elements buffered at a time while decoding payloads.
const BUFFER_CAPACITY: usize = 512;

/// A flat, typed element array.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedData {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
}

impl TypedData {
    pub fn len(&self) -> usize {
        match *self {
            TypedData::I8(ref v) => v.len(),
            TypedData::U8(ref v) => v.len(),
            TypedData::I16(ref v) => v.len(),
            TypedData::U16(ref v) => v.len(),
            TypedData::I32(ref v) => v.len(),
            TypedData::U32(ref v) => v.len(),
            TypedData::I64(ref v) => v.len(),
            TypedData::U64(ref v) => v.len(),
            TypedData::F32(ref v) => v.len(),
            TypedData::F64(ref v) => v.len(),
            TypedData::Bool(ref v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32s(&self) -> Option<&[f32]> {
        match *self {
            TypedData::F32(ref v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64s(&self) -> Option<&[f64]> {
        match *self {
            TypedData::F64(ref v) => Some(v),
            _ => None,
        }
    }
}

fn decode<R: Read, T>(rdr: R, count: usize, size: usize,
                      elem: impl Fn(&[u8]) -> T) -> io::Result<Vec<T>> {
    let mut br = LimitedBufferReader::new(rdr, count, size, BUFFER_CAPACITY);
    let mut data = Vec::with_capacity(count);
    for _ in 0..count {
        data.push(elem(br.read_next()?));
    }
    Ok(data)
}

pub fn read_i8<R: Read>(rdr: R, count: usize) -> io::Result<Vec<i8>> {
    decode(rdr, count, 1, |b| b[0] as i8)
}

pub fn read_u8<R: Read>(rdr: R, count: usize) -> io::Result<Vec<u8>> {
    decode(rdr, count, 1, |b| b[0])
}

pub fn read_i16<R: Read>(rdr: R, count: usize) -> io::Result<Vec<i16>> {
    decode(rdr, count, 2, LittleEndian::read_i16)
}

pub fn read_u16<R: Read>(rdr: R, count: usize) -> io::Result<Vec<u16>> {
    decode(rdr, count, 2, LittleEndian::read_u16)
}

pub fn read_i32<R: Read>(rdr: R, count: usize) -> io::Result<Vec<i32>> {
    decode(rdr, count, 4, LittleEndian::read_i32)
}

pub fn read_u32<R: Read>(rdr: R, count: usize) -> io::Result<Vec<u32>> {
    decode(rdr, count, 4, LittleEndian::read_u32)
}

pub fn read_i64<R: Read>(rdr: R, count: usize) -> io::Result<Vec<i64>> {
    decode(rdr, count, 8, LittleEndian::read_i64)
}

pub fn read_u64<R: Read>(rdr: R, count: usize) -> io::Result<Vec<u64>> {
    decode(rdr, count, 8, LittleEndian::read_u64)
}

pub fn read_f32<R: Read>(rdr: R, count: usize) -> io::Result<Vec<f32>> {
    decode(rdr, count, 4, LittleEndian::read_f32)
}

pub fn read_f64<R: Read>(rdr: R, count: usize) -> io::Result<Vec<f64>> {
    decode(rdr, count, 8, LittleEndian::read_f64)
}

pub fn read_bool<R: Read>(rdr: R, count: usize) -> io::Result<Vec<bool>> {
    decode(rdr, count, 1, |b| b[0] != 0)
}

pub fn read_f16<R: Read>(rdr: R, count: usize) -> io::Result<Vec<f32>> {
    decode(rdr, count, 2, |b| f16::f16_to_f32(LittleEndian::read_u16(b)))
}

pub fn read_bf16<R: Read>(rdr: R, count: usize) -> io::Result<Vec<f32>> {
    decode(rdr, count, 2, |b| f16::bf16_to_f32(LittleEndian::read_u16(b)))
}
