//! Guest linear memory views.
//!
//! The guest owns one linear memory. The host sees it through a
//! [`LinearBuffer`] and eight typed views over that buffer. When the guest
//! grows its memory it moves to a new buffer and detaches the old one, so
//! the views must be republished ([`MemoryViews::publish`]). A view held
//! across an allocation may be stale: reads through a detached buffer fail
//! with [`BridgeError::MemoryOutOfBounds`].

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;
use core::marker::PhantomData;

use crate::error::{BridgeError, BridgeResult};

/// WASM page size in bytes (64 KB).
pub const PAGE_SIZE: usize = 65536;

struct BufferData {
    bytes: Vec<u8>,
    detached: bool,
}

/// Shared handle to one backing buffer of guest memory.
#[derive(Clone)]
pub struct LinearBuffer(Rc<RefCell<BufferData>>);

impl LinearBuffer {
    /// Create a zeroed buffer of `size` bytes.
    pub fn new(size: usize) -> Self {
        LinearBuffer(Rc::new(RefCell::new(BufferData {
            bytes: vec![0; size],
            detached: false,
        })))
    }

    /// Current size in bytes (0 once detached).
    pub fn len(&self) -> u32 {
        self.0.borrow().bytes.len() as u32
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether growth moved the memory to another buffer.
    pub fn is_detached(&self) -> bool {
        self.0.borrow().detached
    }

    /// Whether both handles refer to the same buffer.
    pub fn same_buffer(&self, other: &LinearBuffer) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Move the contents into a new, larger buffer and detach this one.
    pub fn grow_into(&self, new_size: usize) -> LinearBuffer {
        let mut data = self.0.borrow_mut();
        let mut bytes = core::mem::take(&mut data.bytes);
        data.detached = true;
        if bytes.len() < new_size {
            bytes.resize(new_size, 0);
        }
        LinearBuffer(Rc::new(RefCell::new(BufferData {
            bytes,
            detached: false,
        })))
    }

    /// Copy `out.len()` bytes starting at `address`.
    pub fn read(&self, address: u32, out: &mut [u8]) -> BridgeResult<()> {
        let data = self.0.borrow();
        let range = check_bounds(data.bytes.len(), address, out.len())?;
        out.copy_from_slice(&data.bytes[range]);
        Ok(())
    }

    /// Copy `len` bytes starting at `address` into a new vector.
    pub fn read_vec(&self, address: u32, len: u32) -> BridgeResult<Vec<u8>> {
        let data = self.0.borrow();
        let range = check_bounds(data.bytes.len(), address, len as usize)?;
        Ok(data.bytes[range].to_vec())
    }

    /// Write `bytes` starting at `address`.
    pub fn write(&self, address: u32, bytes: &[u8]) -> BridgeResult<()> {
        let mut data = self.0.borrow_mut();
        let range = check_bounds(data.bytes.len(), address, bytes.len())?;
        data.bytes[range].copy_from_slice(bytes);
        Ok(())
    }
}

impl fmt::Debug for LinearBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearBuffer")
            .field("len", &self.len())
            .field("detached", &self.is_detached())
            .finish()
    }
}

fn check_bounds(size: usize, address: u32, len: usize) -> BridgeResult<core::ops::Range<usize>> {
    let start = address as usize;
    match start.checked_add(len) {
        Some(end) if end <= size => Ok(start..end),
        _ => Err(BridgeError::MemoryOutOfBounds {
            address,
            len: len as u32,
            size: size as u32,
        }),
    }
}

// ── Elements ─────────────────────────────────────────────────────────

/// Numeric element of a typed view.
pub trait Element: Copy {
    /// Element size in bytes.
    const SIZE: u32;
    /// Element kind tag.
    const KIND: ElementKind;

    /// Decode from little-endian bytes (`bytes.len() == SIZE`).
    fn from_le(bytes: &[u8]) -> Self;
    /// Encode as little-endian bytes into `out` (`out.len() == SIZE`).
    fn write_le(self, out: &mut [u8]);
    /// Widen to a host number.
    fn to_f64(self) -> f64;
}

macro_rules! element {
    ($ty:ty, $kind:expr) => {
        impl Element for $ty {
            const SIZE: u32 = core::mem::size_of::<$ty>() as u32;
            const KIND: ElementKind = $kind;

            fn from_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; core::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

element!(u8, ElementKind::U8);
element!(i8, ElementKind::I8);
element!(u16, ElementKind::U16);
element!(i16, ElementKind::I16);
element!(u32, ElementKind::U32);
element!(i32, ElementKind::I32);
element!(f32, ElementKind::F32);
element!(f64, ElementKind::F64);

/// Element kind of a typed view slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ElementKind {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    F32 = 6,
    F64 = 7,
}

impl ElementKind {
    /// Element size in bytes.
    pub fn size(self) -> u32 {
        match self {
            ElementKind::U8 | ElementKind::I8 => 1,
            ElementKind::U16 | ElementKind::I16 => 2,
            ElementKind::U32 | ElementKind::I32 | ElementKind::F32 => 4,
            ElementKind::F64 => 8,
        }
    }
}

impl TryFrom<u32> for ElementKind {
    type Error = BridgeError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => ElementKind::U8,
            1 => ElementKind::I8,
            2 => ElementKind::U16,
            3 => ElementKind::I16,
            4 => ElementKind::U32,
            5 => ElementKind::I32,
            6 => ElementKind::F32,
            7 => ElementKind::F64,
            other => return Err(BridgeError::InvalidElementKind(other)),
        })
    }
}

// ── Typed views ──────────────────────────────────────────────────────

/// A typed window over a whole buffer, indexed in elements.
#[derive(Clone)]
pub struct TypedView<T: Element> {
    buffer: LinearBuffer,
    _marker: PhantomData<T>,
}

impl<T: Element> TypedView<T> {
    fn new(buffer: LinearBuffer) -> Self {
        TypedView {
            buffer,
            _marker: PhantomData,
        }
    }

    /// Number of whole elements in the buffer.
    pub fn len(&self) -> u32 {
        self.buffer.len() / T::SIZE
    }

    /// Whether the view holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read element `index`.
    pub fn get(&self, index: u32) -> BridgeResult<T> {
        let address = self.byte_address(index)?;
        let mut raw = [0u8; 8];
        let raw = &mut raw[..T::SIZE as usize];
        self.buffer.read(address, raw)?;
        Ok(T::from_le(raw))
    }

    /// Write element `index`.
    pub fn set(&self, index: u32, value: T) -> BridgeResult<()> {
        let address = self.byte_address(index)?;
        let mut raw = [0u8; 8];
        let raw = &mut raw[..T::SIZE as usize];
        value.write_le(raw);
        self.buffer.write(address, raw)
    }

    /// Read the element at byte `address`, which must be element aligned.
    pub fn load(&self, address: u32) -> BridgeResult<T> {
        self.get(aligned_index::<T>(address)?)
    }

    /// Write the element at byte `address`, which must be element aligned.
    pub fn store(&self, address: u32, value: T) -> BridgeResult<()> {
        self.set(aligned_index::<T>(address)?, value)
    }

    /// Zero-copy sub-view over elements `[start, end)`.
    pub fn subarray(&self, start: u32, end: u32) -> BridgeResult<TypedArray> {
        if end < start || end > self.len() {
            return Err(BridgeError::MemoryOutOfBounds {
                address: start.saturating_mul(T::SIZE),
                len: end.saturating_sub(start).saturating_mul(T::SIZE),
                size: self.buffer.len(),
            });
        }
        Ok(TypedArray {
            kind: T::KIND,
            buffer: self.buffer.clone(),
            start,
            len: end - start,
        })
    }

    fn byte_address(&self, index: u32) -> BridgeResult<u32> {
        index
            .checked_mul(T::SIZE)
            .ok_or(BridgeError::MemoryOutOfBounds {
                address: u32::MAX,
                len: T::SIZE,
                size: self.buffer.len(),
            })
    }
}

fn aligned_index<T: Element>(address: u32) -> BridgeResult<u32> {
    if address % T::SIZE != 0 {
        return Err(BridgeError::Misaligned {
            address,
            align: T::SIZE,
        });
    }
    Ok(address / T::SIZE)
}

/// The published set of views over the current guest buffer.
#[derive(Clone)]
pub struct MemoryViews {
    buffer: LinearBuffer,
    generation: u64,
    heap8: TypedView<i8>,
    heap16: TypedView<i16>,
    heap32: TypedView<i32>,
    heapu8: TypedView<u8>,
    heapu16: TypedView<u16>,
    heapu32: TypedView<u32>,
    heapf32: TypedView<f32>,
    heapf64: TypedView<f64>,
}

impl MemoryViews {
    /// Build all eight views over `buffer`.
    pub fn publish(buffer: LinearBuffer, generation: u64) -> Self {
        MemoryViews {
            heap8: TypedView::new(buffer.clone()),
            heap16: TypedView::new(buffer.clone()),
            heap32: TypedView::new(buffer.clone()),
            heapu8: TypedView::new(buffer.clone()),
            heapu16: TypedView::new(buffer.clone()),
            heapu32: TypedView::new(buffer.clone()),
            heapf32: TypedView::new(buffer.clone()),
            heapf64: TypedView::new(buffer.clone()),
            buffer,
            generation,
        }
    }

    /// The buffer these views cover.
    pub fn buffer(&self) -> &LinearBuffer {
        &self.buffer
    }

    /// The fault for an access of `len` bytes at `address` through these views.
    pub fn out_of_bounds(&self, address: u32, len: u32) -> BridgeError {
        BridgeError::MemoryOutOfBounds {
            address,
            len,
            size: self.buffer.len(),
        }
    }

    /// Check that `count` entries of `stride` bytes at `base` lie inside
    /// the buffer.
    pub fn check_table(&self, base: u32, count: u32, stride: u32) -> BridgeResult<()> {
        let bytes = count.checked_mul(stride);
        match bytes.and_then(|bytes| base.checked_add(bytes)) {
            Some(end) if end <= self.buffer.len() => Ok(()),
            _ => Err(self.out_of_bounds(base, bytes.unwrap_or(u32::MAX))),
        }
    }

    /// How many times views were published before this set.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn heap8(&self) -> &TypedView<i8> {
        &self.heap8
    }

    pub fn heap16(&self) -> &TypedView<i16> {
        &self.heap16
    }

    pub fn heap32(&self) -> &TypedView<i32> {
        &self.heap32
    }

    pub fn heapu8(&self) -> &TypedView<u8> {
        &self.heapu8
    }

    pub fn heapu16(&self) -> &TypedView<u16> {
        &self.heapu16
    }

    pub fn heapu32(&self) -> &TypedView<u32> {
        &self.heapu32
    }

    pub fn heapf32(&self) -> &TypedView<f32> {
        &self.heapf32
    }

    pub fn heapf64(&self) -> &TypedView<f64> {
        &self.heapf64
    }

    /// Zero-copy typed sub-view of `kind` over elements `[start, end)`.
    pub fn subarray(&self, kind: ElementKind, start: u32, end: u32) -> BridgeResult<TypedArray> {
        match kind {
            ElementKind::U8 => self.heapu8.subarray(start, end),
            ElementKind::I8 => self.heap8.subarray(start, end),
            ElementKind::U16 => self.heapu16.subarray(start, end),
            ElementKind::I16 => self.heap16.subarray(start, end),
            ElementKind::U32 => self.heapu32.subarray(start, end),
            ElementKind::I32 => self.heap32.subarray(start, end),
            ElementKind::F32 => self.heapf32.subarray(start, end),
            ElementKind::F64 => self.heapf64.subarray(start, end),
        }
    }
}

// ── Typed arrays ─────────────────────────────────────────────────────

/// A non-owning typed window into guest memory.
///
/// `start` and `len` count elements of `kind`. The window shares the guest
/// buffer, so writes by the guest are visible and growth detaches it.
#[derive(Clone)]
pub struct TypedArray {
    kind: ElementKind,
    buffer: LinearBuffer,
    start: u32,
    len: u32,
}

impl TypedArray {
    /// Element kind.
    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// First element index within the guest memory.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Number of elements.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte address of the first element.
    pub fn byte_offset(&self) -> u32 {
        self.start * self.kind.size()
    }

    /// Length in bytes.
    pub fn byte_len(&self) -> u32 {
        self.len * self.kind.size()
    }

    /// The guest buffer this window looks into.
    pub fn buffer(&self) -> &LinearBuffer {
        &self.buffer
    }

    /// Read element `index` widened to a host number.
    pub fn get(&self, index: u32) -> BridgeResult<f64> {
        if index >= self.len {
            return Err(BridgeError::MemoryOutOfBounds {
                address: self.byte_offset() + index.saturating_mul(self.kind.size()),
                len: self.kind.size(),
                size: self.byte_offset() + self.byte_len(),
            });
        }
        let address = (self.start + index) * self.kind.size();
        let mut raw = [0u8; 8];
        let raw = &mut raw[..self.kind.size() as usize];
        self.buffer.read(address, raw)?;
        Ok(match self.kind {
            ElementKind::U8 => <u8 as Element>::from_le(raw).to_f64(),
            ElementKind::I8 => <i8 as Element>::from_le(raw).to_f64(),
            ElementKind::U16 => <u16 as Element>::from_le(raw).to_f64(),
            ElementKind::I16 => <i16 as Element>::from_le(raw).to_f64(),
            ElementKind::U32 => <u32 as Element>::from_le(raw).to_f64(),
            ElementKind::I32 => <i32 as Element>::from_le(raw).to_f64(),
            ElementKind::F32 => <f32 as Element>::from_le(raw).to_f64(),
            ElementKind::F64 => <f64 as Element>::from_le(raw),
        })
    }

    /// Copy the window's bytes out of guest memory.
    pub fn to_bytes(&self) -> BridgeResult<Vec<u8>> {
        self.buffer.read_vec(self.byte_offset(), self.byte_len())
    }
}

impl PartialEq for TypedArray {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.start == other.start
            && self.len == other.len
            && self.buffer.same_buffer(&other.buffer)
    }
}

impl fmt::Debug for TypedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedArray")
            .field("kind", &self.kind)
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
