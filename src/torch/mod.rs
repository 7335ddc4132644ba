// Copyright (c) 2015-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Reading PyTorch checkpoint files.
//!
//! Two on-disk layouts exist.  The current format is a zip archive whose
//! directory carries `data.pkl` (a pickle of the checkpoint object graph)
//! next to one raw little-endian payload file per storage.  The legacy
//! format is a bare concatenation of pickles (magic number, protocol
//! version, system info, the root object, the storage key order) followed
//! by the length-prefixed payloads.  Both are driven by the same pickle
//! interpreter; only the persistent-id resolver differs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use std::rc::Rc;

use tracing::debug;
use zip::ZipArchive;

use crate::class::ClassRegistry;
use crate::de::Unpickler;
use crate::error::{Error, ErrorCode, Result};
use crate::value::{Callable, ClassRef, Value};

pub mod storage;
pub mod tensor;

use self::storage::{ScalarKind, Storage};
use self::tensor::RebuildTensorV2;

/// Hex form of the big integer opening a legacy checkpoint stream.
const MAGIC_NUMBER_HEX: &str = "1950a86a20f9469cfc6c";
/// Serialization protocol version of the legacy format.
const PROTOCOL_VERSION: i64 = 1001;

/// Loads a checkpoint file, detecting the layout.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Value> {
    load_with_registry(path, ClassRegistry::new())
}

/// Like [`load`], with a caller-supplied class registry for whatever
/// producer-side classes the checkpoint references beyond tensors.
pub fn load_with_registry<P: AsRef<Path>>(path: P, registry: ClassRegistry<'_>)
                                          -> Result<Value> {
    let file = File::open(path.as_ref())?;
    match ZipArchive::new(file) {
        Ok(archive) => {
            debug!(path = %path.as_ref().display(), "loading zip checkpoint");
            load_archive_with_registry(archive, registry)
        }
        Err(_) => {
            debug!(path = %path.as_ref().display(), "loading legacy checkpoint");
            let file = File::open(path.as_ref())?;
            load_legacy_with_registry(BufReader::new(file), registry)
        }
    }
}

/// Adds the tensor layer's classes to a registry: the tensor rebuild
/// function, the storage classes, and a historical backend getter found in
/// old checkpoints.
pub fn register_classes(registry: &mut ClassRegistry<'_>) {
    registry.register("torch._utils", "_rebuild_tensor_v2",
                      Value::Callable(Rc::new(RebuildTensorV2)));
    for kind in ScalarKind::all() {
        registry.register("torch", kind.storage_class(),
                          Value::Class(Rc::new(ClassRef::new("torch", kind.storage_class()))));
    }
    registry.register("torch.nn.backends.thnn", "_get_thnn_function_backend",
                      Value::Callable(Rc::new(ThnnFunctionBackend)));
}

// Referenced by pickles written before torch 1.0; never used afterwards.
struct ThnnFunctionBackend;

impl Callable for ThnnFunctionBackend {
    fn name(&self) -> &str { "torch.nn.backends.thnn._get_thnn_function_backend" }

    fn call(&self, _args: Vec<Value>) -> Result<Value> {
        Ok(Value::None)
    }
}

/// Loads the current zip-archive layout.
pub fn load_archive<R: Read + Seek>(archive: ZipArchive<R>) -> Result<Value> {
    load_archive_with_registry(archive, ClassRegistry::new())
}

pub fn load_archive_with_registry<R: Read + Seek>(mut archive: ZipArchive<R>,
                                                  mut registry: ClassRegistry<'_>)
                                                  -> Result<Value> {
    register_classes(&mut registry);

    // Entries are referenced by basename from inside data.pkl.
    let mut records: HashMap<String, String> = HashMap::new();
    for name in archive.file_names() {
        let base = name.rsplit('/').next().unwrap_or(name);
        records.insert(base.to_string(), name.to_string());
    }
    if records.contains_key("constants.pkl") {
        return Err(Error::Syntax(ErrorCode::UnsupportedFeature(
            "TorchScript archive".into())));
    }
    let data_name = match records.get("data.pkl") {
        Some(name) => name.clone(),
        None => return Err(Error::Syntax(ErrorCode::Archive(
            "data.pkl not found in archive".into()))),
    };
    debug!(records = records.len(), "indexed checkpoint archive");

    let mut data = Vec::new();
    archive.by_name(&data_name).map_err(zip_err)?.read_to_end(&mut data)?;

    let archive = RefCell::new(archive);
    let storages: RefCell<HashMap<String, Value>> = RefCell::new(HashMap::new());

    let mut up = Unpickler::with_registry(&data[..], registry);
    up.set_persistent_load(|pid| {
        let id = parse_storage_id(&pid, 5)?;
        if let Some(value) = storages.borrow().get(&id.key) {
            return Ok(value.clone());
        }
        let full_name = match records.get(&id.key) {
            Some(name) => name,
            None => return Err(Error::Syntax(ErrorCode::MissingStorage(id.key))),
        };
        let mut archive = archive.borrow_mut();
        let entry = archive.by_name(full_name).map_err(zip_err)?;
        let mut storage = Storage::new(id.kind, id.count, id.location);
        storage.read_data(entry, id.count)?;
        debug!(key = %id.key, count = id.count, "loaded storage record");
        let value = Value::Storage(Rc::new(RefCell::new(storage)));
        storages.borrow_mut().insert(id.key, value.clone());
        Ok(value)
    });
    up.load()
}

/// Loads the legacy concatenated-stream layout.
pub fn load_legacy<R: Read>(rdr: R) -> Result<Value> {
    load_legacy_with_registry(rdr, ClassRegistry::new())
}

pub fn load_legacy_with_registry<R: Read>(mut rdr: R, mut registry: ClassRegistry<'_>)
                                          -> Result<Value> {
    register_classes(&mut registry);

    read_and_check_magic_number(&mut rdr)?;
    read_and_check_protocol_version(&mut rdr)?;
    // System info pickle, consumed and ignored.
    Unpickler::new(&mut rdr).load()?;

    let storages: RefCell<HashMap<String, Value>> = RefCell::new(HashMap::new());
    let root = {
        let mut up = Unpickler::with_registry(&mut rdr, registry);
        up.set_persistent_load(|pid| legacy_persistent_load(&storages, pid));
        up.load()?
    };

    // The storage keys name the payloads that follow, in order.
    let keys_value = Unpickler::new(&mut rdr).load()?;
    let keys = match keys_value.list_items() {
        Some(items) => items,
        None => return Err(Error::Syntax(ErrorCode::Protocol(
            "invalid storage keys data".into()))),
    };
    debug!(storages = keys.len(), "reading legacy storage payloads");
    for key in keys {
        let key = match key.as_str() {
            Some(key) => key.to_string(),
            None => return Err(Error::Syntax(ErrorCode::Protocol(
                "invalid storage key".into()))),
        };
        let value = storages.borrow().get(&key).cloned();
        match value {
            Some(Value::Storage(storage)) =>
                storage.borrow_mut().read_data_prefixed(&mut rdr)?,
            _ => return Err(Error::Syntax(ErrorCode::MissingStorage(key))),
        }
    }
    Ok(root)
}

struct StorageId {
    kind: ScalarKind,
    key: String,
    location: String,
    count: usize,
    view_metadata: Option<Value>,
}

/// Decomposes a `("storage", class, key, location, count[, view])`
/// persistent id tuple.
fn parse_storage_id(pid: &Value, min_len: usize) -> Result<StorageId> {
    let protocol = |msg: &str| Error::Syntax(ErrorCode::Protocol(msg.into()));
    let tuple = pid.tuple_items()
        .ok_or_else(|| protocol("persistent id: non-empty tuple expected"))?;
    if tuple.is_empty() {
        return Err(protocol("persistent id: non-empty tuple expected"));
    }
    match tuple[0].as_str() {
        Some("storage") => {}
        Some(other) => return Err(Error::Syntax(ErrorCode::Protocol(
            format!("unknown persistent id tag '{}'", other)))),
        None => return Err(protocol("persistent id: cannot get tag")),
    }
    if tuple.len() < min_len {
        return Err(protocol("persistent id: unexpected storage data length"));
    }
    let kind = match tuple[1] {
        Value::Class(ref class) => class.name.parse::<ScalarKind>()
            .map_err(Error::Syntax)?,
        _ => return Err(protocol("persistent id: storage class expected")),
    };
    let key = tuple[2].as_str()
        .ok_or_else(|| protocol("persistent id: storage key expected"))?;
    let location = tuple[3].as_str()
        .ok_or_else(|| protocol("persistent id: location expected"))?;
    let count = tuple[4].as_usize()
        .ok_or_else(|| protocol("persistent id: element count expected"))?;
    Ok(StorageId {
        kind,
        key: key.to_string(),
        location: location.to_string(),
        count,
        view_metadata: tuple.get(5).cloned(),
    })
}

fn legacy_persistent_load(storages: &RefCell<HashMap<String, Value>>, pid: Value)
                          -> Result<Value> {
    let tag = pid.tuple_items()
        .and_then(|t| t.first().and_then(|v| v.as_str().map(str::to_string)));
    if tag.as_deref() == Some("module") {
        let tuple = pid.tuple_items().expect("checked above");
        if tuple.len() < 2 {
            return Err(Error::Syntax(ErrorCode::Protocol(
                "persistent id: unexpected module data length".into())));
        }
        return Ok(tuple[1].clone());
    }

    let id = parse_storage_id(&pid, 6)?;
    match id.view_metadata {
        None | Some(Value::None) => {}
        Some(_) => return Err(Error::Syntax(ErrorCode::UnsupportedFeature(
            "storage view metadata".into()))),
    }
    if let Some(value) = storages.borrow().get(&id.key) {
        return Ok(value.clone());
    }
    // The payload arrives later in the stream; hand out an empty handle
    // that the trailing section fills in.
    let storage = Storage::new(id.kind, id.count, id.location);
    let value = Value::Storage(Rc::new(RefCell::new(storage)));
    storages.borrow_mut().insert(id.key, value.clone());
    Ok(value)
}

fn read_and_check_magic_number<R: Read>(rdr: &mut R) -> Result<()> {
    match Unpickler::new(&mut *rdr).load()? {
        Value::Int(n) if n.to_str_radix(16) == MAGIC_NUMBER_HEX => Ok(()),
        _ => Err(Error::Syntax(ErrorCode::InvalidMagicNumber)),
    }
}

fn read_and_check_protocol_version<R: Read>(rdr: &mut R) -> Result<()> {
    match Unpickler::new(&mut *rdr).load()?.as_i64() {
        Some(PROTOCOL_VERSION) => Ok(()),
        _ => Err(Error::Syntax(ErrorCode::InvalidProtocolVersion)),
    }
}

fn zip_err(err: zip::result::ZipError) -> Error {
    Error::Syntax(ErrorCode::Archive(err.to_string()))
}
