//! Reference-counted buffer handle

use crate::error::{BufferError, Result};
use crate::{BUFFER_FREED, BUFFER_GUARD, DATA_ALIGN};
use std::alloc::{self, Layout};
use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::OnceLock;

type AuxRecord = Box<dyn Any + Send + Sync>;

/// Refcounts above this are treated as a leak and abort, as `Arc` does.
const MAX_REFCOUNT: u32 = u32::MAX / 2;

#[repr(C)]
struct Header {
    lead_guard: AtomicU32,
    refcount: AtomicU32,
    aux_ptrs: AtomicU32,
    size: usize,
    aux: OnceLock<AuxRecord>,
    trail_guard: AtomicU32,
}

impl Header {
    fn check_guard(&self) {
        let lead = self.lead_guard.load(Ordering::Relaxed);
        let trail = self.trail_guard.load(Ordering::Relaxed);
        if lead != BUFFER_GUARD || trail != BUFFER_GUARD {
            panic!(
                "SharedBuffer guard corrupted at {:p}: lead {:#010x} trail {:#010x} refcount {}",
                self,
                lead,
                trail,
                self.refcount.load(Ordering::Relaxed)
            );
        }
    }
}

const fn data_offset() -> usize {
    let header = std::mem::size_of::<Header>();
    (header + DATA_ALIGN - 1) & !(DATA_ALIGN - 1)
}

const fn buffer_align() -> usize {
    let header = std::mem::align_of::<Header>();
    if header > DATA_ALIGN {
        header
    } else {
        DATA_ALIGN
    }
}

fn layout_for(size: usize) -> Result<Layout> {
    let total = data_offset()
        .checked_add(size)
        .ok_or(BufferError::SizeOverflow { size })?;
    Layout::from_size_align(total, buffer_align()).map_err(|_| BufferError::SizeOverflow { size })
}

/// Handle to an atomically reference-counted byte buffer.
///
/// A handle is either null or points at a live allocation. Cloning aliases the
/// same storage; the storage is released when the last handle is dropped.
/// Contents can only be mutated through [`SharedBuffer::get_mut`], which
/// requires the handle to be the sole owner, so a buffer is immutable once it
/// has been shared.
pub struct SharedBuffer {
    ptr: Option<NonNull<Header>>,
}

// SAFETY: the header is only mutated through atomics or while uniquely owned
// (refcount 1 via `get_mut`, refcount 0 in `release`). The hosted aux record
// is `Send + Sync`.
unsafe impl Send for SharedBuffer {}
// SAFETY: see above; shared access never writes the data region.
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// A handle with no storage.
    pub const fn null() -> Self {
        Self { ptr: None }
    }

    /// Allocate `size` zeroed bytes with a refcount of 1.
    pub fn allocate(size: usize) -> Result<Self> {
        let layout = layout_for(size)?;

        // SAFETY: the layout always covers the header, so it is never zero-sized.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(raw) else {
            return Err(BufferError::AllocationFailed { size });
        };

        let header = base.cast::<Header>();
        // SAFETY: `base` is a fresh allocation aligned for `Header`.
        unsafe {
            header.as_ptr().write(Header {
                lead_guard: AtomicU32::new(BUFFER_GUARD),
                refcount: AtomicU32::new(1),
                aux_ptrs: AtomicU32::new(0),
                size,
                aux: OnceLock::new(),
                trail_guard: AtomicU32::new(BUFFER_GUARD),
            });
        }

        Ok(Self { ptr: Some(header) })
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut buf = Self::allocate(bytes.len())?;
        if let Some(data) = buf.get_mut() {
            data.copy_from_slice(bytes);
        }
        Ok(buf)
    }

    fn header(&self) -> Option<&Header> {
        // SAFETY: a non-null handle keeps the allocation alive.
        self.ptr.map(|p| unsafe { &*p.as_ptr() })
    }

    fn data_ptr(p: NonNull<Header>) -> *mut u8 {
        // SAFETY: the data region starts `data_offset()` bytes into the allocation.
        unsafe { p.as_ptr().cast::<u8>().add(data_offset()) }
    }

    /// True when the handle has no storage.
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// Size of the data region in bytes (0 for a null handle).
    pub fn size(&self) -> usize {
        self.header().map_or(0, |h| h.size)
    }

    /// Current refcount (0 for a null handle).
    pub fn ref_count(&self) -> u32 {
        self.header()
            .map_or(0, |h| h.refcount.load(Ordering::Acquire))
    }

    /// Address of the storage, for identity comparisons and diagnostics.
    pub fn base_addr(&self) -> usize {
        self.ptr.map_or(0, |p| p.as_ptr() as usize)
    }

    /// Panic if the guard words around the header have been overwritten.
    pub fn check_guard(&self) {
        if let Some(header) = self.header() {
            header.check_guard();
        }
    }

    /// Read-only view of the data region.
    pub fn as_slice(&self) -> &[u8] {
        match self.ptr {
            None => &[],
            Some(p) => {
                self.check_guard();
                let size = self.size();
                // SAFETY: the data region is `size` initialized bytes and is
                // never written while more than one handle exists.
                unsafe { std::slice::from_raw_parts(Self::data_ptr(p), size) }
            }
        }
    }

    /// Mutable view of the data region, only while this is the sole handle.
    pub fn get_mut(&mut self) -> Option<&mut [u8]> {
        let p = self.ptr?;
        self.check_guard();
        if self.ref_count() != 1 {
            return None;
        }
        let size = self.size();
        // SAFETY: refcount 1 and `&mut self` make this the only accessor.
        Some(unsafe { std::slice::from_raw_parts_mut(Self::data_ptr(p), size) })
    }

    /// Set how many auxiliary pointers must be released before the storage
    /// may be reused.
    pub fn set_aux_ptr_count(&self, count: u32) -> Result<()> {
        let header = self.header().ok_or(BufferError::NullHandle)?;
        header.check_guard();
        header.aux_ptrs.store(count, Ordering::Release);
        Ok(())
    }

    /// Number of outstanding auxiliary pointers.
    pub fn aux_ptr_count(&self) -> u32 {
        self.header()
            .map_or(0, |h| h.aux_ptrs.load(Ordering::Acquire))
    }

    /// Host an auxiliary record inside this buffer.
    ///
    /// The record counts as one aux pointer and is dropped right before the
    /// storage is released. Only one record can be attached.
    pub fn attach_aux<T: Any + Send + Sync>(&self, record: T) -> Result<&T> {
        let header = self.header().ok_or(BufferError::NullHandle)?;
        header.check_guard();

        header
            .aux
            .set(Box::new(record))
            .map_err(|_| BufferError::AuxAlreadyAttached)?;
        header.aux_ptrs.fetch_add(1, Ordering::AcqRel);

        self.aux::<T>().ok_or(BufferError::AuxAlreadyAttached)
    }

    /// The hosted auxiliary record, if one of type `T` is attached.
    pub fn aux<T: Any + Send + Sync>(&self) -> Option<&T> {
        let header = self.header()?;
        header.check_guard();
        header.aux.get()?.downcast_ref::<T>()
    }

    /// Drop this handle's reference, leaving a null handle behind.
    pub fn clear(&mut self) {
        *self = Self::null();
    }

    /// Move the reference out, leaving a null handle behind.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Release storage whose refcount just reached zero.
    ///
    /// # Safety
    ///
    /// `p` must point at a live header whose refcount has reached zero, with an
    /// acquire fence after the final decrement.
    unsafe fn release(p: NonNull<Header>) {
        // SAFETY: refcount is zero, so nothing else can observe the header.
        let header = unsafe { &mut *p.as_ptr() };
        header.check_guard();

        // hosted records may own other buffers; release them first
        if let Some(record) = header.aux.take() {
            drop(record);
            let aux = header.aux_ptrs.get_mut();
            *aux = aux.saturating_sub(1);
        }

        let outstanding = *header.aux_ptrs.get_mut();
        if outstanding != 0 {
            tracing::error!(
                "[shared-buffer] storage at {:p} withheld: refcount 0 with {} aux pointers outstanding",
                header,
                outstanding
            );
            return;
        }

        let size = header.size;
        header.lead_guard.store(BUFFER_FREED, Ordering::Relaxed);
        header.trail_guard.store(BUFFER_FREED, Ordering::Relaxed);

        // SAFETY: same size/align as `allocate`, which already validated it.
        let layout = unsafe { Layout::from_size_align_unchecked(data_offset() + size, buffer_align()) };
        // SAFETY: the header was written by `allocate` and is dropped once here.
        unsafe {
            std::ptr::drop_in_place(p.as_ptr());
            alloc::dealloc(p.as_ptr().cast::<u8>(), layout);
        }
    }
}

impl Default for SharedBuffer {
    fn default() -> Self {
        Self::null()
    }
}

impl Clone for SharedBuffer {
    fn clone(&self) -> Self {
        if let Some(header) = self.header() {
            header.check_guard();
            let previous = header.refcount.fetch_add(1, Ordering::Relaxed);
            if previous > MAX_REFCOUNT {
                std::process::abort();
            }
        }
        Self { ptr: self.ptr }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        let Some(p) = self.ptr.take() else {
            return;
        };

        // SAFETY: this handle still holds a reference.
        let header = unsafe { p.as_ref() };
        if !std::thread::panicking() {
            header.check_guard();
        }

        if header.refcount.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);

        // SAFETY: the refcount just reached zero and the fence is in place.
        unsafe { Self::release(p) };
    }
}

impl PartialEq for SharedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for SharedBuffer {}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("addr", &format_args!("{:#x}", self.base_addr()))
            .field("size", &self.size())
            .field("refcount", &self.ref_count())
            .field("aux_ptrs", &self.aux_ptr_count())
            .finish()
    }
}
