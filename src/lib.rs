// Copyright (c) 2015-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Reading Python's pickle format and PyTorch tensor checkpoints
//!
//! # Pickle format
//!
//! Please see the [Python docs](http://docs.python.org/library/pickle) for
//! details on the Pickle format.
//!
//! This crate supports all Pickle protocols (0 to 5) when reading.  Writing
//! pickles is out of scope.
//!
//! # Supported types
//!
//! The decoded object graph is represented by the [`Value`] enum: `None`,
//! booleans, machine and arbitrary-precision integers, floats, byte strings
//! and byte arrays, (Unicode) strings, lists, tuples, sets and frozensets,
//! insertion-ordered dictionaries and `collections.OrderedDict`, typed
//! `array.array` values, class references, and generic objects for
//! producer-side classes this crate does not know.
//!
//! Mutable containers are shared handles: a value memoized in the stream and
//! referenced twice decodes to the *same* list or dict, and self-referential
//! graphs are preserved.  Equality on `Value` is by content for scalars and
//! by identity for mutable containers accordingly.
//!
//! Class lookup is driven by a [`ClassRegistry`]: a mapping from
//! `(module, name)` pairs to constructors, extensible by the caller, with an
//! optional fallback hook.  Reductions over unregistered classes produce
//! generic [`Object`] values carrying the class reference and arguments.
//!
//! ```
//! let value = torch_pickle::value_from_slice(b"\x80\x02K*.").unwrap();
//! assert_eq!(value, torch_pickle::Value::I64(42));
//! ```
//!
//! Decoded values can be turned into ordinary Rust types through serde with
//! [`from_value`], [`from_slice`] or [`from_reader`].
//!
//! *Note on strings:* protocol-0 `STRING` opcodes written by Python 2 carry
//! their escape sequences literally; they are pushed verbatim (quotes
//! stripped), and callers wanting the decoded text must unescape it.  The
//! binary string opcodes decode to text when the payload is UTF-8 and to
//! byte strings otherwise.
//!
//! # Tensor checkpoints
//!
//! [`load`] reads a PyTorch checkpoint file in either the current
//! zip-archive layout or the legacy concatenated-stream layout, resolving
//! tensor storages through the pickle persistent-id mechanism:
//!
//! ```no_run
//! # fn main() -> torch_pickle::Result<()> {
//! let checkpoint = torch_pickle::load("model.pt")?;
//! println!("{:?}", checkpoint);
//! # Ok(())
//! # }
//! ```
//!
//! Storages ([`Storage`]) hold flat typed element arrays; tensors
//! ([`Tensor`]) are views over them (offset, shape, stride, gradient flag).
//! Half-precision and bfloat16 payloads are widened to `f32` while loading.
//!
//! # Unsupported features
//!
//! - Writing pickles.
//! - The extension registry opcodes (`EXT1`/`EXT2`/`EXT4`).
//! - Out-of-band buffers, unless a buffer source is installed on the
//!   [`Unpickler`].
//! - TorchScript archives (refused with an error).

pub use crate::class::{ClassFallback, ClassRegistry};
pub use crate::de::{from_reader, from_slice, value_from_reader, value_from_slice, Unpickler};
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::read::LimitedBufferReader;
pub use crate::torch::storage::{ScalarKind, Storage};
pub use crate::torch::tensor::Tensor;
pub use crate::torch::{load, load_archive, load_legacy, load_with_registry};
pub use crate::typed::TypedData;
pub use crate::value::{Callable, ClassRef, Dict, Object, OrderedDict, Set, Value};
pub use crate::value_impls::{from_value, Deserializer};

mod consts;
pub mod class;
pub mod de;
pub mod error;
pub mod f16;
pub mod read;
pub mod torch;
pub mod typed;
pub mod value;
mod value_impls;

#[cfg(test)]
#[path = "../test/mod.rs"]
mod test;
