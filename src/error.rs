// Copyright (c) 2015-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Error objects and codes

use std::error;
use std::fmt;
use std::io;
use std::result;

use serde::de;

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorCode {
    /// Opcode byte not recognized
    UnknownOpcode(u8),
    /// Read source exhausted mid-opcode or mid-operand
    UnexpectedEnd,
    /// Stack underflowed
    StackUnderflow,
    /// A frame opcode found no mark on the stack
    NoMark,
    /// A value was missing from the memo
    MemoMiss(u32),
    /// Class lookup refused by both the registry and the fallback
    ClassNotFound(String, String),
    /// Wrong stack top type for opcode
    InvalidStackTop(&'static str, String),
    /// Value not hashable, but used as dict key or set item
    ValueNotHashable,
    /// Length prefix found negative
    NegativeLength,
    /// String decoding as UTF-8 failed
    StringNotUtf8,
    /// Invalid literal found
    InvalidLiteral(Vec<u8>),
    /// Found trailing bytes after STOP opcode
    TrailingBytes,
    /// Malformed operand or argument
    Protocol(String),
    /// Feature present in the stream but deliberately not supported
    UnsupportedFeature(String),
    /// Legacy file header magic number mismatch
    InvalidMagicNumber,
    /// Legacy file protocol version mismatch
    InvalidProtocolVersion,
    /// A referenced storage payload could not be found
    MissingStorage(String),
    /// Problem with the surrounding archive container
    Archive(String),
    /// Structure deserialization error (e.g., unknown variant)
    Structure(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ErrorCode::UnknownOpcode(byte) => write!(fmt, "unknown opcode {:?}", byte as char),
            ErrorCode::UnexpectedEnd => write!(fmt, "unexpected end of input"),
            ErrorCode::StackUnderflow => write!(fmt, "pickle stack underflow"),
            ErrorCode::NoMark => write!(fmt, "no mark on the stack"),
            ErrorCode::MemoMiss(n) => write!(fmt, "missing memo with id {}", n),
            ErrorCode::ClassNotFound(ref m, ref g) =>
                write!(fmt, "class not found: {}.{}", m, g),
            ErrorCode::InvalidStackTop(what, ref it) =>
                write!(fmt, "invalid stack top, expected {}, got {}", what, it),
            ErrorCode::ValueNotHashable => write!(fmt, "dict key or set item not hashable"),
            ErrorCode::NegativeLength => write!(fmt, "negative length prefix"),
            ErrorCode::StringNotUtf8 => write!(fmt, "string is not UTF-8 encoded"),
            ErrorCode::InvalidLiteral(ref l) =>
                write!(fmt, "literal is invalid: {}", String::from_utf8_lossy(l)),
            ErrorCode::TrailingBytes => write!(fmt, "trailing bytes found"),
            ErrorCode::Protocol(ref s) => write!(fmt, "protocol error: {}", s),
            ErrorCode::UnsupportedFeature(ref s) => write!(fmt, "unsupported feature: {}", s),
            ErrorCode::InvalidMagicNumber => write!(fmt, "invalid checkpoint magic number"),
            ErrorCode::InvalidProtocolVersion => write!(fmt, "invalid checkpoint protocol version"),
            ErrorCode::MissingStorage(ref k) => write!(fmt, "storage record '{}' not found", k),
            ErrorCode::Archive(ref s) => write!(fmt, "archive error: {}", s),
            ErrorCode::Structure(ref s) => fmt.write_str(s),
        }
    }
}

/// This type represents all possible errors that can occur when reading a
/// pickle stream or a tensor checkpoint.
#[derive(Debug)]
pub enum Error {
    /// Some IO error occurred while reading.
    Io(io::Error),
    /// The pickle had some error while interpreting, at the given offset.
    Eval(ErrorCode, usize),
    /// Error outside of the interpreter loop (loaders, registry, serde).
    Syntax(ErrorCode),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::Io(error)
    }
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref error) => error.fmt(fmt),
            Error::Eval(ref code, offset) => write!(fmt, "eval error at offset {}: {}",
                                                    offset, code),
            Error::Syntax(ref code) => write!(fmt, "decoding error: {}", code),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Io(ref error) => Some(error),
            _ => None,
        }
    }
}

impl de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Error {
        Error::Syntax(ErrorCode::Structure(msg.to_string()))
    }
}
