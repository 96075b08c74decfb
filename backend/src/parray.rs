// parray.rs — Portable Array
//
// Typed, value-semantic container whose physical layout is picked per element
// kind and storage mode. Composite element types are stored as one nested
// Portable Array per field (structure-of-arrays); every operation fans out to
// the fields positionally. Arithmetic-progression arrays can be collapsed to
// a 3-slot sequence encoding `(start, stride, aux)`.
//
// Preconditions: `get`/`put` indices are below `size()`; out-of-range access
//                panics.
// Postconditions: ownership of storage is a tree; no element storage is shared
//                 between arrays.
// Failure modes: `ParrayError` for unsupported `(kind, mode)` pairs, shape
//                mismatches, invalid chunking requests and device buffers of
//                the wrong shape.
// Side effects: none.

use serde::{Deserialize, Serialize};

use crate::error::ParrayError;
use crate::storage::{BufferRef, DeviceBuffer, Storage, StorageMode};
use crate::types::{ScalarKind, TypeDescriptor, Value};

/// Number of physical slots of a sequence-encoded field.
pub const SEQUENCE_SLOTS: usize = 3;

// ── Sequence flags ──────────────────────────────────────────────────────────

/// Per-field decoding markers. `flag` selects integer division by the aux
/// bound, `compass` selects modulo; a consumer that sees both uses `flag`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceFlags {
    pub sequence: bool,
    pub compass: bool,
    pub flag: bool,
}

/// How a linear index maps onto the progression of a sequence field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceDecode {
    Linear,
    Divide,
    Modulo,
}

impl SequenceFlags {
    pub fn decode(&self) -> SequenceDecode {
        if self.flag {
            SequenceDecode::Divide
        } else if self.compass {
            SequenceDecode::Modulo
        } else {
            SequenceDecode::Linear
        }
    }
}

/// The `(start, stride, aux)` slots of one sequence-encoded field, as the
/// kernel generator needs them to decode elements in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSequence {
    pub start: Value,
    pub stride: Value,
    pub aux: Value,
    pub decode: SequenceDecode,
}

/// Sequence encoding of a whole array, one entry per scalar field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceLayout {
    pub fields: Vec<FieldSequence>,
}

// ── Portable Array ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Layout {
    /// Scalar field, or whole boxed elements under `StorageMode::Object`.
    Flat(Storage),
    /// One nested array per tuple field.
    Fields(Vec<PArray>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PArray {
    ty: TypeDescriptor,
    mode: StorageMode,
    size: usize,
    layout: Layout,
    flags: SequenceFlags,
    total_size: Option<usize>,
}

impl PArray {
    /// Allocate `size` zeroed elements in the default (pinned byte buffer) mode.
    pub fn new(size: usize, ty: TypeDescriptor) -> Result<Self, ParrayError> {
        Self::construct(size, ty, StorageMode::Default, true)
    }

    pub fn with_mode(size: usize, ty: TypeDescriptor, mode: StorageMode) -> Result<Self, ParrayError> {
        Self::construct(size, ty, mode, true)
    }

    /// Build an array of `size` elements. With `init == false` the field
    /// buffers are left unallocated until `set_buffer_reference` supplies
    /// them. Composite types recurse with the same size, mode and `init`.
    pub fn construct(
        size: usize,
        ty: TypeDescriptor,
        mode: StorageMode,
        init: bool,
    ) -> Result<Self, ParrayError> {
        ty.validate()?;
        let alloc_len = if init { size } else { 0 };
        let layout = match &ty {
            TypeDescriptor::Scalar(kind) => Layout::Flat(Storage::allocate(*kind, mode, alloc_len)?),
            TypeDescriptor::Composite(_) if mode == StorageMode::Object => {
                Layout::Flat(Storage::boxed(Value::zero(&ty), alloc_len))
            }
            TypeDescriptor::Composite(fields) => Layout::Fields(
                fields
                    .iter()
                    .map(|f| PArray::construct(size, f.clone(), mode, init))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        };
        Ok(PArray {
            ty,
            mode,
            size,
            layout,
            flags: SequenceFlags::default(),
            total_size: None,
        })
    }

    /// Build an array holding `values`, in order.
    pub fn from_values(
        ty: TypeDescriptor,
        mode: StorageMode,
        values: &[Value],
    ) -> Result<Self, ParrayError> {
        let mut array = Self::with_mode(values.len(), ty, mode)?;
        for (i, v) in values.iter().enumerate() {
            array.put(i, v)?;
        }
        Ok(array)
    }

    pub fn element_type(&self) -> &TypeDescriptor {
        &self.ty
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    /// Physical element count: 3 once the sequence encoding is enabled.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Logical element count, which outlives the sequence encoding.
    pub fn logical_len(&self) -> usize {
        if self.flags.sequence {
            self.total_size.unwrap_or(self.size)
        } else {
            self.size
        }
    }

    pub fn total_size_when_sequence(&self) -> Option<usize> {
        self.total_size
    }

    pub fn set_total_size(&mut self, total: usize) {
        self.total_size = Some(total);
    }

    /// Nested field array, for composite structure-of-arrays layouts.
    pub fn field(&self, index: usize) -> Option<&PArray> {
        match &self.layout {
            Layout::Fields(fields) => fields.get(index),
            Layout::Flat(_) => None,
        }
    }

    pub fn is_structure_of_arrays(&self) -> bool {
        matches!(self.layout, Layout::Fields(_))
    }

    // ── Element access ──

    /// Copy `value` into slot `index`. Scalars are converted to the element
    /// kind; tuples must match the element arity.
    pub fn put(&mut self, index: usize, value: &Value) -> Result<(), ParrayError> {
        let mismatch = || ParrayError::ValueMismatch {
            expected: self.ty.to_string(),
            found: value.to_string(),
        };
        match (&mut self.layout, value) {
            (Layout::Fields(fields), Value::Tuple(items)) => {
                if items.len() != fields.len() {
                    return Err(mismatch());
                }
                for (field, item) in fields.iter_mut().zip(items) {
                    field.put(index, item)?;
                }
                Ok(())
            }
            (Layout::Fields(_), _) => Err(mismatch()),
            (Layout::Flat(storage), Value::Tuple(items)) => {
                if items.len() != self.ty.arity() || !self.ty.is_composite() {
                    return Err(mismatch());
                }
                storage.put(index, value);
                Ok(())
            }
            (Layout::Flat(storage), scalar) => {
                if self.ty.is_composite() {
                    return Err(mismatch());
                }
                storage.put(index, scalar);
                Ok(())
            }
        }
    }

    pub fn get(&self, index: usize) -> Value {
        match &self.layout {
            Layout::Flat(storage) => storage.get(index),
            Layout::Fields(fields) => Value::Tuple(fields.iter().map(|f| f.get(index)).collect()),
        }
    }

    /// Every physical element, in order.
    pub fn to_vec(&self) -> Vec<Value> {
        (0..self.size).map(|i| self.get(i)).collect()
    }

    // ── Device transfer boundary ──

    /// Raw storage of field `field` (0 for scalar arrays).
    pub fn buffer_reference(&self, field: usize) -> Result<BufferRef<'_>, ParrayError> {
        let storage = self.field_storage(field)?;
        storage.device_buffer().ok_or(ParrayError::NoDeviceBuffer { mode: self.mode })
    }

    /// Replace the raw storage of field `field` with a buffer produced by the
    /// device runtime. The element count must equal `size()`.
    pub fn set_buffer_reference(
        &mut self,
        field: usize,
        buffer: DeviceBuffer,
    ) -> Result<(), ParrayError> {
        let expected = self.size;
        let mode = self.mode;
        let arity = self.ty.arity();
        let storage = match &mut self.layout {
            Layout::Flat(storage) if field == 0 => storage,
            Layout::Flat(_) => return Err(ParrayError::FieldOutOfRange { field, arity }),
            Layout::Fields(fields) => match fields.get_mut(field) {
                Some(PArray {
                    layout: Layout::Flat(storage),
                    ..
                }) => storage,
                Some(_) => return Err(ParrayError::NestedField(field)),
                None => return Err(ParrayError::FieldOutOfRange { field, arity }),
            },
        };
        if matches!(storage, Storage::Boxed(_)) {
            return Err(ParrayError::NoDeviceBuffer { mode });
        }
        storage.replace_device_buffer(buffer, expected)
    }

    fn field_storage(&self, field: usize) -> Result<&Storage, ParrayError> {
        let arity = self.ty.arity();
        match &self.layout {
            Layout::Flat(storage) if field == 0 => Ok(storage),
            Layout::Flat(_) => Err(ParrayError::FieldOutOfRange { field, arity }),
            Layout::Fields(fields) => match fields.get(field) {
                Some(PArray {
                    layout: Layout::Flat(storage),
                    ..
                }) => Ok(storage),
                Some(_) => Err(ParrayError::NestedField(field)),
                None => Err(ParrayError::FieldOutOfRange { field, arity }),
            },
        }
    }

    /// Index metadata passed next to the array in kernels: `[length, base offset]`.
    pub fn index_metadata(&self) -> Result<[i32; 2], ParrayError> {
        Ok([metadata_word("length", self.logical_len())?, 0])
    }

    // ── Sequence encoding ──

    pub fn flags(&self) -> SequenceFlags {
        self.flags
    }

    pub fn is_sequence(&self) -> bool {
        self.flags.sequence
    }

    /// Flags of field `field`; a scalar array answers for field 0.
    pub fn field_flags(&self, field: usize) -> Option<SequenceFlags> {
        match &self.layout {
            Layout::Fields(fields) => fields.get(field).map(|f| f.flags),
            Layout::Flat(_) if field == 0 => Some(self.flags),
            Layout::Flat(_) => None,
        }
    }

    pub fn set_flag(&mut self, on: bool) {
        self.update_flags(|f| f.flag = on);
    }

    pub fn set_compass(&mut self, on: bool) {
        self.update_flags(|f| f.compass = on);
    }

    pub fn set_field_flag(&mut self, field: usize, on: bool) -> Result<(), ParrayError> {
        self.update_field_flags(field, |f| f.flag = on)
    }

    pub fn set_field_compass(&mut self, field: usize, on: bool) -> Result<(), ParrayError> {
        self.update_field_flags(field, |f| f.compass = on)
    }

    fn update_flags(&mut self, apply: impl Fn(&mut SequenceFlags) + Copy) {
        apply(&mut self.flags);
        if let Layout::Fields(fields) = &mut self.layout {
            for field in fields {
                field.update_flags(apply);
            }
        }
    }

    fn update_field_flags(
        &mut self,
        field: usize,
        apply: impl Fn(&mut SequenceFlags) + Copy,
    ) -> Result<(), ParrayError> {
        let arity = self.ty.arity();
        match &mut self.layout {
            Layout::Fields(fields) => match fields.get_mut(field) {
                Some(f) => {
                    f.update_flags(apply);
                    Ok(())
                }
                None => Err(ParrayError::FieldOutOfRange { field, arity }),
            },
            Layout::Flat(_) if field == 0 => {
                apply(&mut self.flags);
                Ok(())
            }
            Layout::Flat(_) => Err(ParrayError::FieldOutOfRange { field, arity }),
        }
    }

    /// Collapse the array to the 3-slot encoding `(start, stride, aux)`. For
    /// composite arrays the three values are tuples and field `k` takes
    /// component `k` of each. The logical length is preserved in
    /// `total_size_when_sequence`.
    pub fn enable_sequence(
        &mut self,
        start: &Value,
        stride: &Value,
        aux: &Value,
    ) -> Result<(), ParrayError> {
        let slots = self.sequence_slots(start, stride, aux)?;
        self.apply_sequence(slots)
    }

    /// `(start, stride, aux)` per scalar field, checked against the element
    /// type before anything is modified.
    fn sequence_slots(
        &self,
        start: &Value,
        stride: &Value,
        aux: &Value,
    ) -> Result<Vec<[Value; SEQUENCE_SLOTS]>, ParrayError> {
        match &self.layout {
            Layout::Flat(_) => match self.ty.scalar_kind() {
                Some(ScalarKind::Boolean) => Err(ParrayError::SequenceKind(ScalarKind::Boolean)),
                Some(_) => Ok(vec![[start.clone(), stride.clone(), aux.clone()]]),
                None => Err(ParrayError::BoxedSequence),
            },
            Layout::Fields(fields) => {
                let mut slots = Vec::with_capacity(fields.len());
                for (k, field) in fields.iter().enumerate() {
                    let component = |v: &Value| {
                        v.field(k).cloned().ok_or_else(|| ParrayError::ValueMismatch {
                            expected: self.ty.to_string(),
                            found: v.to_string(),
                        })
                    };
                    slots.extend(field.sequence_slots(
                        &component(start)?,
                        &component(stride)?,
                        &component(aux)?,
                    )?);
                }
                Ok(slots)
            }
        }
    }

    /// Install checked slots, consuming them in field order.
    fn apply_sequence(&mut self, slots: Vec<[Value; SEQUENCE_SLOTS]>) -> Result<(), ParrayError> {
        let mut slots = slots.into_iter();
        self.apply_sequence_from(&mut slots)
    }

    fn apply_sequence_from(
        &mut self,
        slots: &mut impl Iterator<Item = [Value; SEQUENCE_SLOTS]>,
    ) -> Result<(), ParrayError> {
        let logical = self.logical_len();
        match &mut self.layout {
            Layout::Flat(storage) => {
                let [start, stride, aux] = slots.next().ok_or(ParrayError::BoxedSequence)?;
                storage.reallocate(SEQUENCE_SLOTS);
                storage.put(0, &start);
                storage.put(1, &stride);
                storage.put(2, &aux);
            }
            Layout::Fields(fields) => {
                for field in fields.iter_mut() {
                    field.apply_sequence_from(slots)?;
                }
            }
        }
        self.size = SEQUENCE_SLOTS;
        self.flags.sequence = true;
        self.total_size = Some(logical);
        Ok(())
    }

    /// Element `index` of the logical sequence. Arrays without the sequence
    /// encoding return the stored element.
    pub fn decode_sequence(&self, index: usize) -> Value {
        if !self.flags.sequence {
            return self.get(index);
        }
        match &self.layout {
            Layout::Fields(fields) => {
                Value::Tuple(fields.iter().map(|f| f.decode_sequence(index)).collect())
            }
            Layout::Flat(storage) => {
                let start = storage.get(0);
                let stride = storage.get(1);
                let aux = storage.get(2).as_i64().max(0) as usize;
                let m = match self.flags.decode() {
                    SequenceDecode::Divide if aux != 0 => index / aux,
                    SequenceDecode::Modulo if aux != 0 => index % aux,
                    _ => index,
                };
                decode_progression(&start, &stride, m)
            }
        }
    }

    /// Slot values and decoding of every scalar field, or `None` when the
    /// array is not sequence-encoded.
    pub fn sequence_layout(&self) -> Option<SequenceLayout> {
        if !self.flags.sequence {
            return None;
        }
        match &self.layout {
            Layout::Flat(storage) => Some(SequenceLayout {
                fields: vec![FieldSequence {
                    start: storage.get(0),
                    stride: storage.get(1),
                    aux: storage.get(2),
                    decode: self.flags.decode(),
                }],
            }),
            Layout::Fields(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for field in fields {
                    out.extend(field.sequence_layout()?.fields);
                }
                Some(SequenceLayout { fields: out })
            }
        }
    }

    // ── Slicing and chunking ──

    /// Read-only view of `len` elements starting at `start`.
    pub fn slice(&self, start: usize, len: usize) -> Result<ArraySlice<'_>, ParrayError> {
        let end = start.checked_add(len);
        if end.map_or(true, |end| end > self.size) {
            return Err(ParrayError::SliceOutOfRange {
                start,
                len,
                size: self.size,
            });
        }
        Ok(ArraySlice {
            array: self,
            offset: start,
            len,
        })
    }

    /// Partition `[0, size)` into slices of `chunk` elements; the last slice
    /// takes whatever remains.
    pub fn split_in_chunks_of_size(&self, chunk: usize) -> Result<Vec<ArraySlice<'_>>, ParrayError> {
        if chunk == 0 {
            return Err(ParrayError::ZeroChunkSize);
        }
        Ok(self.slices_from(chunks_of_size(self.size, chunk)))
    }

    /// Partition `[0, size)` into `count` slices of `size / count` elements;
    /// the last slice absorbs the remainder.
    pub fn split_in_fixed_number_of_chunks(
        &self,
        count: usize,
    ) -> Result<Vec<ArraySlice<'_>>, ParrayError> {
        if count == 0 {
            return Err(ParrayError::ZeroChunkCount);
        }
        Ok(self.slices_from(fixed_chunks(self.size, count)))
    }

    fn slices_from(&self, bounds: Vec<(usize, usize)>) -> Vec<ArraySlice<'_>> {
        bounds
            .into_iter()
            .map(|(offset, len)| ArraySlice {
                array: self,
                offset,
                len,
            })
            .collect()
    }
}

fn decode_progression(start: &Value, stride: &Value, m: usize) -> Value {
    let Some(kind) = start.kind() else {
        return start.clone();
    };
    if kind.is_floating() {
        Value::Double(start.as_f64() + stride.as_f64() * m as f64).cast(kind)
    } else {
        Value::Long(start.as_i64() + stride.as_i64() * m as i64).cast(kind)
    }
}

fn metadata_word(what: &'static str, value: usize) -> Result<i32, ParrayError> {
    i32::try_from(value).map_err(|_| ParrayError::IndexOverflow { what, value })
}

/// `(start, len)` pairs of `ceil(size / chunk)` contiguous chunks.
pub fn chunks_of_size(size: usize, chunk: usize) -> Vec<(usize, usize)> {
    if chunk == 0 || size == 0 {
        return Vec::new();
    }
    let count = size.div_ceil(chunk);
    (0..count)
        .map(|i| {
            let start = i * chunk;
            (start, chunk.min(size - start))
        })
        .collect()
}

/// `(start, len)` pairs of `count` contiguous chunks of `size / count`
/// elements, the last one absorbing the remainder. With `count > size` the
/// leading chunks are empty.
pub fn fixed_chunks(size: usize, count: usize) -> Vec<(usize, usize)> {
    if count == 0 {
        return Vec::new();
    }
    let chunk = size / count;
    (0..count)
        .map(|i| {
            let start = i * chunk;
            let len = if i + 1 == count { size - start } else { chunk };
            (start, len)
        })
        .collect()
}

// ── Slices ──────────────────────────────────────────────────────────────────

/// Non-owning, read-only window into a Portable Array.
#[derive(Debug, Clone, Copy)]
pub struct ArraySlice<'a> {
    array: &'a PArray,
    offset: usize,
    len: usize,
}

impl<'a> ArraySlice<'a> {
    pub fn get(&self, index: usize) -> Value {
        self.array.get(index + self.offset)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn element_type(&self) -> &'a TypeDescriptor {
        &self.array.ty
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.array.mode
    }

    /// The parent's buffer; devices address it through `index_metadata`.
    pub fn buffer_reference(&self, field: usize) -> Result<BufferRef<'a>, ParrayError> {
        self.array.buffer_reference(field)
    }

    pub fn index_metadata(&self) -> Result<[i32; 2], ParrayError> {
        Ok([
            metadata_word("length", self.len)?,
            metadata_word("offset", self.offset)?,
        ])
    }

    /// Copy the window into a standalone array with the parent's type and mode.
    pub fn to_parray(&self) -> Result<PArray, ParrayError> {
        let values: Vec<Value> = (0..self.len).map(|i| self.get(i)).collect();
        PArray::from_values(self.array.ty.clone(), self.array.mode, &values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TypeError;

    fn float_pair() -> TypeDescriptor {
        TypeDescriptor::uniform(ScalarKind::Float, 2).unwrap()
    }

    fn ints(n: i32) -> PArray {
        let values: Vec<Value> = (0..n).map(Value::Int).collect();
        PArray::from_values(TypeDescriptor::Scalar(ScalarKind::Int), StorageMode::Default, &values)
            .unwrap()
    }

    #[test]
    fn scalar_put_get() {
        let mut a = PArray::new(4, TypeDescriptor::Scalar(ScalarKind::Double)).unwrap();
        a.put(3, &Value::Double(2.5)).unwrap();
        assert_eq!(a.get(3), Value::Double(2.5));
        assert_eq!(a.get(0), Value::Double(0.0));
        assert_eq!(a.size(), 4);
    }

    #[test]
    fn composite_is_structure_of_arrays() {
        let mut a = PArray::new(3, float_pair()).unwrap();
        a.put(1, &Value::Tuple(vec![Value::Float(1.0), Value::Float(3.0)]))
            .unwrap();
        assert!(a.is_structure_of_arrays());
        assert_eq!(a.field(1).unwrap().get(1), Value::Float(3.0));
        assert_eq!(
            a.get(1),
            Value::Tuple(vec![Value::Float(1.0), Value::Float(3.0)])
        );
    }

    #[test]
    fn object_mode_boxes_tuples() {
        let mut a = PArray::with_mode(2, float_pair(), StorageMode::Object).unwrap();
        assert!(!a.is_structure_of_arrays());
        a.put(0, &Value::Tuple(vec![Value::Float(1.0), Value::Float(2.0)]))
            .unwrap();
        assert_eq!(
            a.get(0),
            Value::Tuple(vec![Value::Float(1.0), Value::Float(2.0)])
        );
        assert!(matches!(
            a.buffer_reference(0),
            Err(ParrayError::NoDeviceBuffer { .. })
        ));
    }

    #[test]
    fn boolean_byte_buffer_is_unsupported() {
        let err = PArray::new(4, TypeDescriptor::Scalar(ScalarKind::Boolean)).unwrap_err();
        assert!(matches!(
            err,
            ParrayError::Type(TypeError::UnsupportedType {
                kind: ScalarKind::Boolean,
                ..
            })
        ));
        let tuple = TypeDescriptor::composite(vec![
            TypeDescriptor::Scalar(ScalarKind::Int),
            TypeDescriptor::Scalar(ScalarKind::Boolean),
        ])
        .unwrap();
        assert!(PArray::new(4, tuple.clone()).is_err());
        assert!(PArray::with_mode(4, tuple, StorageMode::NativeBuffers).is_ok());
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut a = PArray::new(2, float_pair()).unwrap();
        assert!(a.put(0, &Value::Float(1.0)).is_err());
        assert!(a.put(0, &Value::Tuple(vec![Value::Float(1.0)])).is_err());
        let mut s = ints(2);
        assert!(s.put(0, &Value::Tuple(vec![Value::Int(1)])).is_err());
    }

    #[test]
    fn deferred_allocation_takes_device_buffer() {
        let mut a = PArray::construct(
            2,
            TypeDescriptor::Scalar(ScalarKind::Int),
            StorageMode::NativeBuffers,
            false,
        )
        .unwrap();
        assert_eq!(a.size(), 2);
        a.set_buffer_reference(
            0,
            DeviceBuffer::Native(crate::storage::NativeBuffer::Int(vec![5, 6])),
        )
        .unwrap();
        assert_eq!(a.get(1), Value::Int(6));
    }

    #[test]
    fn buffer_reference_per_field() {
        let a = PArray::new(5, float_pair()).unwrap();
        assert_eq!(a.buffer_reference(1).unwrap().byte_len(), 20);
        assert!(matches!(
            a.buffer_reference(2),
            Err(ParrayError::FieldOutOfRange { field: 2, arity: 2 })
        ));
    }

    #[test]
    fn sequence_keeps_logical_length() {
        let mut a = ints(100);
        a.enable_sequence(&Value::Int(10), &Value::Int(3), &Value::Int(0))
            .unwrap();
        assert_eq!(a.size(), 3);
        assert_eq!(a.total_size_when_sequence(), Some(100));
        assert_eq!(a.logical_len(), 100);
        assert!(a.is_sequence());
        assert_eq!(a.decode_sequence(4), Value::Int(22));
        assert_eq!(a.index_metadata().unwrap(), [100, 0]);
    }

    #[test]
    fn sequence_flag_divides_and_compass_wraps() {
        let mut a = ints(16);
        a.enable_sequence(&Value::Int(0), &Value::Int(1), &Value::Int(4))
            .unwrap();
        a.set_flag(true);
        assert_eq!(a.decode_sequence(9), Value::Int(2));
        a.set_flag(false);
        a.set_compass(true);
        assert_eq!(a.decode_sequence(9), Value::Int(1));
    }

    #[test]
    fn composite_sequence_decodes_per_field() {
        let ty = TypeDescriptor::composite(vec![
            TypeDescriptor::Scalar(ScalarKind::Int),
            TypeDescriptor::Scalar(ScalarKind::Float),
        ])
        .unwrap();
        let mut a = PArray::new(8, ty).unwrap();
        a.enable_sequence(
            &Value::Tuple(vec![Value::Int(0), Value::Float(0.5)]),
            &Value::Tuple(vec![Value::Int(1), Value::Float(2.0)]),
            &Value::Tuple(vec![Value::Int(4), Value::Int(4)]),
        )
        .unwrap();
        a.set_field_flag(0, true).unwrap();
        a.set_field_compass(1, true).unwrap();
        assert_eq!(a.size(), 3);
        assert_eq!(a.field(0).unwrap().size(), 3);
        assert_eq!(
            a.decode_sequence(5),
            Value::Tuple(vec![Value::Int(1), Value::Float(2.5)])
        );
        assert!(a.field_flags(0).unwrap().flag);
        assert!(a.field_flags(1).unwrap().compass);
        assert!(a.set_field_flag(2, true).is_err());

        let layout = a.sequence_layout().unwrap();
        assert_eq!(layout.fields.len(), 2);
        assert_eq!(layout.fields[0].decode, SequenceDecode::Divide);
        assert_eq!(layout.fields[1].decode, SequenceDecode::Modulo);
        assert_eq!(layout.fields[1].stride, Value::Float(2.0));
    }

    #[test]
    fn failed_composite_sequence_leaves_array_untouched() {
        let ty = TypeDescriptor::uniform(ScalarKind::Int, 2).unwrap();
        let values: Vec<Value> = (0..8)
            .map(|i| Value::Tuple(vec![Value::Int(i), Value::Int(-i)]))
            .collect();
        let mut a = PArray::from_values(ty, StorageMode::Default, &values).unwrap();
        let err = a.enable_sequence(
            &Value::Tuple(vec![Value::Int(0), Value::Int(0)]),
            &Value::Tuple(vec![Value::Int(1), Value::Int(1)]),
            &Value::Tuple(vec![Value::Int(4)]),
        );
        assert!(matches!(err, Err(ParrayError::ValueMismatch { .. })));
        assert_eq!(a.size(), 8);
        assert!(!a.is_sequence());
        assert_eq!(a.field(0).unwrap().size(), 8);
        assert_eq!(a.field(1).unwrap().size(), 8);
        assert_eq!(a.to_vec(), values);
    }

    #[test]
    fn boxed_tuples_reject_sequence() {
        let mut a = PArray::with_mode(4, float_pair(), StorageMode::Object).unwrap();
        let pair = Value::Tuple(vec![Value::Float(0.0), Value::Float(1.0)]);
        assert_eq!(
            a.enable_sequence(&pair, &pair, &pair).unwrap_err(),
            ParrayError::BoxedSequence
        );
        assert_eq!(a.size(), 4);
        assert!(!a.is_sequence());
    }

    #[test]
    fn oversized_metadata_is_an_error() {
        assert_eq!(metadata_word("length", 7).unwrap(), 7);
        assert_eq!(
            metadata_word("offset", i32::MAX as usize + 1).unwrap_err(),
            ParrayError::IndexOverflow {
                what: "offset",
                value: i32::MAX as usize + 1
            }
        );
    }

    #[test]
    fn plain_array_has_no_sequence_layout() {
        assert!(ints(4).sequence_layout().is_none());
    }

    #[test]
    fn slice_reads_through_offset() {
        let a = ints(10);
        let s = a.slice(4, 3).unwrap();
        assert_eq!(s.get(0), Value::Int(4));
        assert_eq!(s.len(), 3);
        assert_eq!(s.index_metadata().unwrap(), [3, 4]);
        assert_eq!(s.to_parray().unwrap().to_vec(), vec![Value::Int(4), Value::Int(5), Value::Int(6)]);
        assert!(a.slice(8, 3).is_err());
    }

    #[test]
    fn chunks_of_size_last_takes_remainder() {
        assert_eq!(chunks_of_size(10, 4), vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(chunks_of_size(8, 4), vec![(0, 4), (4, 4)]);
        assert_eq!(chunks_of_size(3, 5), vec![(0, 3)]);
        assert!(chunks_of_size(0, 5).is_empty());
    }

    #[test]
    fn fixed_chunks_last_absorbs_remainder() {
        assert_eq!(fixed_chunks(10, 3), vec![(0, 3), (3, 3), (6, 4)]);
        assert_eq!(fixed_chunks(2, 4), vec![(0, 0), (0, 0), (0, 0), (0, 2)]);
    }

    #[test]
    fn zero_chunk_requests_fail() {
        let a = ints(4);
        assert_eq!(
            a.split_in_chunks_of_size(0).unwrap_err(),
            ParrayError::ZeroChunkSize
        );
        assert_eq!(
            a.split_in_fixed_number_of_chunks(0).unwrap_err(),
            ParrayError::ZeroChunkCount
        );
        let slices = a.split_in_fixed_number_of_chunks(2).unwrap();
        assert_eq!(slices[1].get(1), Value::Int(3));
    }
}
