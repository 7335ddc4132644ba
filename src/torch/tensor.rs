// Copyright (c) 2015-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Tensor records and the rebuild callable the producer reduces them with.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::torch::storage::Storage;
use crate::value::{Callable, Value};

/// A view over a storage: element offset, shape and stride (both in
/// elements), and the gradient flag.
#[derive(Debug)]
pub struct Tensor {
    pub storage: Rc<RefCell<Storage>>,
    pub offset: usize,
    pub size: Vec<usize>,
    pub stride: Vec<usize>,
    pub requires_grad: bool,
}

/// `torch._utils._rebuild_tensor_v2(storage, storage_offset, size, stride,
/// requires_grad, backward_hooks)`.  The hooks argument is ignored.
pub struct RebuildTensorV2;

impl Callable for RebuildTensorV2 {
    fn name(&self) -> &str { "torch._utils._rebuild_tensor_v2" }

    fn call(&self, args: Vec<Value>) -> Result<Value> {
        if args.len() != 6 {
            return Err(protocol(format!("_rebuild_tensor_v2 takes 6 arguments, got {}",
                                        args.len())));
        }
        let storage = match args[0] {
            Value::Storage(ref s) => s.clone(),
            ref other => return Err(protocol(format!("_rebuild_tensor_v2 storage argument: {}",
                                                     other.type_name()))),
        };
        let offset = args[1].as_usize()
            .ok_or_else(|| protocol("_rebuild_tensor_v2 offset must be an integer"))?;
        let size = int_tuple(&args[2])?;
        let stride = int_tuple(&args[3])?;
        if size.len() != stride.len() {
            return Err(protocol(format!("shape/stride rank mismatch: {} vs {}",
                                        size.len(), stride.len())));
        }
        let requires_grad = args[4].as_bool()
            .ok_or_else(|| protocol("_rebuild_tensor_v2 requires_grad must be a bool"))?;

        Ok(Value::Tensor(Rc::new(Tensor {
            storage,
            offset,
            size,
            stride,
            requires_grad,
        })))
    }
}

fn int_tuple(value: &Value) -> Result<Vec<usize>> {
    let items = value.tuple_items()
        .ok_or_else(|| protocol("tuple of ints expected"))?;
    items.iter()
        .map(|item| item.as_usize().ok_or_else(|| protocol("tuple of ints expected")))
        .collect()
}

fn protocol(msg: impl Into<String>) -> Error {
    Error::Syntax(ErrorCode::Protocol(msg.into()))
}
