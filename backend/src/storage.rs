// storage.rs — Per-field storage backends
//
// One scalar field of a Portable Array lives in exactly one backend: a
// native typed vector, a fixed-stride byte buffer (optionally pinned for
// device DMA), or boxed values. The backend is picked by `select_backend`
// from the element kind and the requested storage mode.
//
// Preconditions: indices passed to `get`/`put` are below `len()`.
// Postconditions: `len()` never changes after allocation except through
//                 `replace_device_buffer` with an equal-length buffer.
// Failure modes: `(kind, mode)` pairs without a backend raise
//                `TypeError::UnsupportedType`.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ParrayError, TypeError};
use crate::types::{ScalarKind, Value};

// ── Storage modes ───────────────────────────────────────────────────────────

/// Requested physical layout for a Portable Array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StorageMode {
    /// Pinned byte buffers, the device-friendly default.
    #[default]
    Default,
    /// Native typed vectors.
    NativeBuffers,
    /// Pinned byte buffers, requested explicitly.
    OpenClByteBuffer,
    /// Plain (unpinned) byte buffers.
    ByteBuffer,
    /// Boxed values; no device transfer.
    Object,
}

impl StorageMode {
    pub const ALL: [StorageMode; 5] = [
        StorageMode::Default,
        StorageMode::NativeBuffers,
        StorageMode::OpenClByteBuffer,
        StorageMode::ByteBuffer,
        StorageMode::Object,
    ];

    pub fn is_pinned(self) -> bool {
        matches!(self, StorageMode::Default | StorageMode::OpenClByteBuffer)
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageMode::Default => "default",
            StorageMode::NativeBuffers => "native-buffers",
            StorageMode::OpenClByteBuffer => "opencl-byte-buffer",
            StorageMode::ByteBuffer => "byte-buffer",
            StorageMode::Object => "object",
        })
    }
}

// ── Backend dispatch table ──────────────────────────────────────────────────

/// Backend strategy for one scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Native,
    Bytes { pinned: bool },
    Boxed,
}

/// Resolve the backend for `(kind, mode)`.
///
/// Byte-buffer modes have no boolean encoding; everything else is covered.
pub fn select_backend(kind: ScalarKind, mode: StorageMode) -> Result<Backend, TypeError> {
    use ScalarKind::*;
    match (mode, kind) {
        (StorageMode::Object, _) => Ok(Backend::Boxed),
        (StorageMode::NativeBuffers, _) => Ok(Backend::Native),
        (
            StorageMode::Default | StorageMode::OpenClByteBuffer | StorageMode::ByteBuffer,
            Byte | Char | Short | Int | Long | Float | Double,
        ) => Ok(Backend::Bytes {
            pinned: mode.is_pinned(),
        }),
        (_, Boolean) => Err(TypeError::UnsupportedType { kind, mode }),
    }
}

// ── Native buffers ──────────────────────────────────────────────────────────

/// A typed vector per scalar kind. This is also the exchange format for
/// device buffers of native storage.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeBuffer {
    Byte(Vec<i8>),
    Char(Vec<u8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Boolean(Vec<bool>),
}

macro_rules! each_native {
    ($buf:expr, $v:ident => $body:expr) => {
        match $buf {
            NativeBuffer::Byte($v) => $body,
            NativeBuffer::Char($v) => $body,
            NativeBuffer::Short($v) => $body,
            NativeBuffer::Int($v) => $body,
            NativeBuffer::Long($v) => $body,
            NativeBuffer::Float($v) => $body,
            NativeBuffer::Double($v) => $body,
            NativeBuffer::Boolean($v) => $body,
        }
    };
}

impl NativeBuffer {
    pub fn zeroed(kind: ScalarKind, len: usize) -> Self {
        match kind {
            ScalarKind::Byte => NativeBuffer::Byte(vec![0; len]),
            ScalarKind::Char => NativeBuffer::Char(vec![0; len]),
            ScalarKind::Short => NativeBuffer::Short(vec![0; len]),
            ScalarKind::Int => NativeBuffer::Int(vec![0; len]),
            ScalarKind::Long => NativeBuffer::Long(vec![0; len]),
            ScalarKind::Float => NativeBuffer::Float(vec![0.0; len]),
            ScalarKind::Double => NativeBuffer::Double(vec![0.0; len]),
            ScalarKind::Boolean => NativeBuffer::Boolean(vec![false; len]),
        }
    }

    pub fn kind(&self) -> ScalarKind {
        match self {
            NativeBuffer::Byte(_) => ScalarKind::Byte,
            NativeBuffer::Char(_) => ScalarKind::Char,
            NativeBuffer::Short(_) => ScalarKind::Short,
            NativeBuffer::Int(_) => ScalarKind::Int,
            NativeBuffer::Long(_) => ScalarKind::Long,
            NativeBuffer::Float(_) => ScalarKind::Float,
            NativeBuffer::Double(_) => ScalarKind::Double,
            NativeBuffer::Boolean(_) => ScalarKind::Boolean,
        }
    }

    pub fn len(&self) -> usize {
        each_native!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Value {
        match self {
            NativeBuffer::Byte(v) => Value::Byte(v[index]),
            NativeBuffer::Char(v) => Value::Char(v[index]),
            NativeBuffer::Short(v) => Value::Short(v[index]),
            NativeBuffer::Int(v) => Value::Int(v[index]),
            NativeBuffer::Long(v) => Value::Long(v[index]),
            NativeBuffer::Float(v) => Value::Float(v[index]),
            NativeBuffer::Double(v) => Value::Double(v[index]),
            NativeBuffer::Boolean(v) => Value::Boolean(v[index]),
        }
    }

    fn put(&mut self, index: usize, value: &Value) {
        let value = value.cast(self.kind());
        match (self, value) {
            (NativeBuffer::Byte(v), Value::Byte(x)) => v[index] = x,
            (NativeBuffer::Char(v), Value::Char(x)) => v[index] = x,
            (NativeBuffer::Short(v), Value::Short(x)) => v[index] = x,
            (NativeBuffer::Int(v), Value::Int(x)) => v[index] = x,
            (NativeBuffer::Long(v), Value::Long(x)) => v[index] = x,
            (NativeBuffer::Float(v), Value::Float(x)) => v[index] = x,
            (NativeBuffer::Double(v), Value::Double(x)) => v[index] = x,
            (NativeBuffer::Boolean(v), Value::Boolean(x)) => v[index] = x,
            _ => {}
        }
    }
}

// ── Byte storage ────────────────────────────────────────────────────────────

/// Fixed-stride byte buffer in native byte order, one element per
/// `kind.byte_size()` bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ByteStorage {
    kind: ScalarKind,
    bytes: Vec<u8>,
    pinned: bool,
}

impl ByteStorage {
    fn zeroed(kind: ScalarKind, len: usize, pinned: bool) -> Self {
        ByteStorage {
            kind,
            bytes: vec![0; len * kind.byte_size()],
            pinned,
        }
    }

    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    pub fn stride(&self) -> usize {
        self.kind.byte_size()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / self.stride()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn slot(&self, index: usize) -> &[u8] {
        let s = self.stride();
        &self.bytes[index * s..(index + 1) * s]
    }

    fn get(&self, index: usize) -> Value {
        let b = self.slot(index);
        match self.kind {
            ScalarKind::Byte => Value::Byte(i8::from_ne_bytes([b[0]])),
            ScalarKind::Char => Value::Char(b[0]),
            ScalarKind::Short => Value::Short(i16::from_ne_bytes([b[0], b[1]])),
            ScalarKind::Int => Value::Int(i32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
            ScalarKind::Float => Value::Float(f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
            ScalarKind::Long => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Value::Long(i64::from_ne_bytes(raw))
            }
            ScalarKind::Double => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Value::Double(f64::from_ne_bytes(raw))
            }
            ScalarKind::Boolean => Value::Boolean(b[0] != 0),
        }
    }

    fn put(&mut self, index: usize, value: &Value) {
        let s = self.stride();
        let dst = &mut self.bytes[index * s..(index + 1) * s];
        match value.cast(self.kind) {
            Value::Byte(x) => dst.copy_from_slice(&x.to_ne_bytes()),
            Value::Char(x) => dst[0] = x,
            Value::Short(x) => dst.copy_from_slice(&x.to_ne_bytes()),
            Value::Int(x) => dst.copy_from_slice(&x.to_ne_bytes()),
            Value::Long(x) => dst.copy_from_slice(&x.to_ne_bytes()),
            Value::Float(x) => dst.copy_from_slice(&x.to_ne_bytes()),
            Value::Double(x) => dst.copy_from_slice(&x.to_ne_bytes()),
            Value::Boolean(x) => dst[0] = u8::from(x),
            Value::Tuple(_) => {}
        }
    }
}

// ── Device buffers ──────────────────────────────────────────────────────────

/// Borrowed view of a field's raw storage, handed to the device runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BufferRef<'a> {
    Native(&'a NativeBuffer),
    Bytes {
        kind: ScalarKind,
        bytes: &'a [u8],
        pinned: bool,
    },
}

impl BufferRef<'_> {
    pub fn kind(&self) -> ScalarKind {
        match self {
            BufferRef::Native(buf) => buf.kind(),
            BufferRef::Bytes { kind, .. } => *kind,
        }
    }

    /// Size of the transfer in bytes.
    pub fn byte_len(&self) -> usize {
        match self {
            BufferRef::Native(buf) => buf.len() * buf.kind().byte_size(),
            BufferRef::Bytes { bytes, .. } => bytes.len(),
        }
    }
}

/// Owned replacement storage coming back from the device runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceBuffer {
    Native(NativeBuffer),
    Bytes { kind: ScalarKind, bytes: Vec<u8> },
}

impl DeviceBuffer {
    fn kind(&self) -> ScalarKind {
        match self {
            DeviceBuffer::Native(buf) => buf.kind(),
            DeviceBuffer::Bytes { kind, .. } => *kind,
        }
    }
}

// ── Storage ─────────────────────────────────────────────────────────────────

/// Physical storage of one scalar field (or of whole boxed elements).
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    Native(NativeBuffer),
    Bytes(ByteStorage),
    Boxed(Vec<Value>),
}

impl Storage {
    /// Allocate zeroed storage for `len` elements of `kind` under `mode`.
    pub fn allocate(kind: ScalarKind, mode: StorageMode, len: usize) -> Result<Self, TypeError> {
        Ok(match select_backend(kind, mode)? {
            Backend::Native => Storage::Native(NativeBuffer::zeroed(kind, len)),
            Backend::Bytes { pinned } => Storage::Bytes(ByteStorage::zeroed(kind, len, pinned)),
            Backend::Boxed => Storage::Boxed(vec![Value::Int(0).cast(kind); len]),
        })
    }

    /// Boxed storage for elements of any shape.
    pub fn boxed(init: Value, len: usize) -> Self {
        Storage::Boxed(vec![init; len])
    }

    pub fn len(&self) -> usize {
        match self {
            Storage::Native(buf) => buf.len(),
            Storage::Bytes(buf) => buf.len(),
            Storage::Boxed(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backend(&self) -> Backend {
        match self {
            Storage::Native(_) => Backend::Native,
            Storage::Bytes(buf) => Backend::Bytes { pinned: buf.pinned },
            Storage::Boxed(_) => Backend::Boxed,
        }
    }

    pub fn get(&self, index: usize) -> Value {
        match self {
            Storage::Native(buf) => buf.get(index),
            Storage::Bytes(buf) => buf.get(index),
            Storage::Boxed(values) => values[index].clone(),
        }
    }

    /// Store `value`, converting scalars to the field kind.
    pub fn put(&mut self, index: usize, value: &Value) {
        match self {
            Storage::Native(buf) => buf.put(index, value),
            Storage::Bytes(buf) => buf.put(index, value),
            Storage::Boxed(values) => {
                values[index] = match values[index].kind() {
                    Some(kind) => value.cast(kind),
                    None => value.clone(),
                }
            }
        }
    }

    /// Reallocate to `len` zeroed elements of the same backend and kind.
    pub(crate) fn reallocate(&mut self, len: usize) {
        *self = match self {
            Storage::Native(buf) => Storage::Native(NativeBuffer::zeroed(buf.kind(), len)),
            Storage::Bytes(buf) => Storage::Bytes(ByteStorage::zeroed(buf.kind, len, buf.pinned)),
            Storage::Boxed(values) => {
                let init = values.first().cloned().unwrap_or(Value::Int(0));
                Storage::Boxed(vec![init; len])
            }
        };
    }

    pub fn device_buffer(&self) -> Option<BufferRef<'_>> {
        match self {
            Storage::Native(buf) => Some(BufferRef::Native(buf)),
            Storage::Bytes(buf) => Some(BufferRef::Bytes {
                kind: buf.kind,
                bytes: &buf.bytes,
                pinned: buf.pinned,
            }),
            Storage::Boxed(_) => None,
        }
    }

    /// Swap in storage produced by a device transfer. The replacement must
    /// have the same backend and kind, and hold `expected_len` elements.
    pub fn replace_device_buffer(
        &mut self,
        buffer: DeviceBuffer,
        expected_len: usize,
    ) -> Result<(), ParrayError> {
        let mismatch = |expected: &dyn fmt::Debug, found: &dyn fmt::Debug| {
            ParrayError::BufferMismatch {
                expected: format!("{:?}", expected),
                found: format!("{:?}", found),
            }
        };
        match (self, buffer) {
            (Storage::Native(current), DeviceBuffer::Native(new)) => {
                if current.kind() != new.kind() || new.len() != expected_len {
                    return Err(mismatch(
                        &(current.kind(), expected_len),
                        &(new.kind(), new.len()),
                    ));
                }
                *current = new;
                Ok(())
            }
            (Storage::Bytes(current), DeviceBuffer::Bytes { kind, bytes }) => {
                if current.kind != kind || bytes.len() != expected_len * kind.byte_size() {
                    return Err(mismatch(
                        &(current.kind, expected_len * current.stride()),
                        &(kind, bytes.len()),
                    ));
                }
                current.bytes = bytes;
                Ok(())
            }
            (Storage::Boxed(_), _) => Err(ParrayError::NoDeviceBuffer {
                mode: StorageMode::Object,
            }),
            (current, new) => Err(mismatch(&current.backend(), &new.kind())),
        }
    }
}
