// Copyright (c) 2015-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Tensor storages: flat, typed, 1-D element arrays owned by one or more
//! tensors.

use std::io::Read;
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, ErrorCode, Result};
use crate::typed::{self, TypedData};

/// Element type of a storage, named after the `torch.*Storage` class that
/// declares it in the pickle stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarKind {
    Float64,
    Float32,
    Float16,
    BFloat16,
    Int64,
    Int32,
    Int16,
    Int8,
    Uint8,
    Bool,
}

impl ScalarKind {
    pub fn element_size(self) -> usize {
        match self {
            ScalarKind::Float64 | ScalarKind::Int64 => 8,
            ScalarKind::Float32 | ScalarKind::Int32 => 4,
            ScalarKind::Float16 | ScalarKind::BFloat16 | ScalarKind::Int16 => 2,
            ScalarKind::Int8 | ScalarKind::Uint8 | ScalarKind::Bool => 1,
        }
    }

    /// Storage class name as the producer spells it, e.g. `FloatStorage`.
    pub fn storage_class(self) -> &'static str {
        match self {
            ScalarKind::Float64 => "DoubleStorage",
            ScalarKind::Float32 => "FloatStorage",
            ScalarKind::Float16 => "HalfStorage",
            ScalarKind::BFloat16 => "BFloat16Storage",
            ScalarKind::Int64 => "LongStorage",
            ScalarKind::Int32 => "IntStorage",
            ScalarKind::Int16 => "ShortStorage",
            ScalarKind::Int8 => "CharStorage",
            ScalarKind::Uint8 => "ByteStorage",
            ScalarKind::Bool => "BoolStorage",
        }
    }

    pub fn all() -> [ScalarKind; 10] {
        [ScalarKind::Float64, ScalarKind::Float32, ScalarKind::Float16,
         ScalarKind::BFloat16, ScalarKind::Int64, ScalarKind::Int32,
         ScalarKind::Int16, ScalarKind::Int8, ScalarKind::Uint8, ScalarKind::Bool]
    }

    fn empty_data(self) -> TypedData {
        match self {
            ScalarKind::Float64 => TypedData::F64(vec![]),
            ScalarKind::Float32 | ScalarKind::Float16 | ScalarKind::BFloat16 =>
                TypedData::F32(vec![]),
            ScalarKind::Int64 => TypedData::I64(vec![]),
            ScalarKind::Int32 => TypedData::I32(vec![]),
            ScalarKind::Int16 => TypedData::I16(vec![]),
            ScalarKind::Int8 => TypedData::I8(vec![]),
            ScalarKind::Uint8 => TypedData::U8(vec![]),
            ScalarKind::Bool => TypedData::Bool(vec![]),
        }
    }
}

/// Accepts both the storage class names (`FloatStorage`) and the plain
/// dtype spellings (`float32`, `float`).
impl FromStr for ScalarKind {
    type Err = ErrorCode;

    fn from_str(s: &str) -> std::result::Result<Self, ErrorCode> {
        let name = s.strip_suffix("Storage").unwrap_or(s).to_ascii_lowercase();
        Ok(match name.as_str() {
            "float64" | "double" => ScalarKind::Float64,
            "float32" | "float" => ScalarKind::Float32,
            "float16" | "half" => ScalarKind::Float16,
            "bfloat16" => ScalarKind::BFloat16,
            "int64" | "long" => ScalarKind::Int64,
            "int32" | "int" => ScalarKind::Int32,
            "int16" | "short" => ScalarKind::Int16,
            "int8" | "char" => ScalarKind::Int8,
            "uint8" | "byte" => ScalarKind::Uint8,
            "bool" => ScalarKind::Bool,
            _ => return Err(ErrorCode::Protocol(format!("unknown storage class '{}'", s))),
        })
    }
}

/// One storage handle.  Created empty by the persistent-id resolver and
/// filled from the archive record (current format) or from the trailing
/// payload section (legacy format).
#[derive(Debug)]
pub struct Storage {
    pub kind: ScalarKind,
    /// Element count declared in the persistent id.
    pub size: usize,
    /// Device location string, e.g. `cpu` or `cuda:0`.
    pub location: String,
    pub data: TypedData,
}

impl Storage {
    pub fn new(kind: ScalarKind, size: usize, location: impl Into<String>) -> Storage {
        Storage { kind, size, location: location.into(), data: kind.empty_data() }
    }

    /// Decodes `count` little-endian elements from the reader.
    pub fn read_data<R: Read>(&mut self, rdr: R, count: usize) -> Result<()> {
        self.data = match self.kind {
            ScalarKind::Float64 => TypedData::F64(typed::read_f64(rdr, count)?),
            ScalarKind::Float32 => TypedData::F32(typed::read_f32(rdr, count)?),
            ScalarKind::Float16 => TypedData::F32(typed::read_f16(rdr, count)?),
            ScalarKind::BFloat16 => TypedData::F32(typed::read_bf16(rdr, count)?),
            ScalarKind::Int64 => TypedData::I64(typed::read_i64(rdr, count)?),
            ScalarKind::Int32 => TypedData::I32(typed::read_i32(rdr, count)?),
            ScalarKind::Int16 => TypedData::I16(typed::read_i16(rdr, count)?),
            ScalarKind::Int8 => TypedData::I8(typed::read_i8(rdr, count)?),
            ScalarKind::Uint8 => TypedData::U8(typed::read_u8(rdr, count)?),
            ScalarKind::Bool => TypedData::Bool(typed::read_bool(rdr, count)?),
        };
        Ok(())
    }

    /// Legacy payload section: an 8-byte little-endian element count, then
    /// the elements themselves.
    pub fn read_data_prefixed<R: Read>(&mut self, rdr: &mut R) -> Result<()> {
        let count = rdr.read_u64::<LittleEndian>()?;
        let count = usize::try_from(count)
            .map_err(|_| Error::Syntax(ErrorCode::Protocol("storage payload too large".into())))?;
        self.read_data(rdr, count)
    }
}
