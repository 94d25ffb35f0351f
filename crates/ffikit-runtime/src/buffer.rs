//! Native memory
//!
//! `NativeBuffer` is a reference-counted, zero-filled allocation from the
//! global allocator. Its address never changes for its whole life, so it can
//! be handed to native code as-is. Each buffer carries a keep-alive table
//! keyed by slot offset: a buffer whose address is stored in a pointer slot
//! stays allocated until the slot is overwritten or the holder is dropped.
//!
//! Two buffers that point at each other keep each other alive. The cycle is
//! broken by overwriting either slot (with NULL or any other value); a cycle
//! left in place leaks both allocations.
//!
//! `Region` is a byte range over either a `NativeBuffer` (top-level instances
//! and every sub-view derived from them) or foreign memory identified only by
//! its address.

use crate::error::{FfiError, FfiResult};
use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::ptr::{self, NonNull};
use std::rc::Rc;

/// Alignment of every allocation, enough for any primitive or SIMD lane
pub const BUFFER_ALIGN: usize = 16;

const SLOT_WIDTH: usize = std::mem::size_of::<usize>();

struct Allocation {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    /// Pointer-slot offset → buffer whose address is stored there
    keep_alive: RefCell<BTreeMap<usize, NativeBuffer>>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // SAFETY: allocated in `NativeBuffer::alloc` with this exact layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Owned, non-relocatable native allocation
///
/// Cloning shares the allocation. Memory is freed when the last clone, and
/// every buffer retaining it, is dropped.
#[derive(Clone)]
pub struct NativeBuffer(Rc<Allocation>);

impl NativeBuffer {
    /// Allocate `len` zero bytes
    pub fn alloc(len: usize) -> Self {
        // Zero-size allocations are not allowed by the global allocator
        let size = len.max(1);
        let layout = match Layout::from_size_align(size, BUFFER_ALIGN) {
            Ok(layout) => layout,
            Err(_) => alloc::handle_alloc_error(Layout::new::<u8>()),
        };
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        NativeBuffer(Rc::new(Allocation {
            ptr,
            len,
            layout,
            keep_alive: RefCell::new(BTreeMap::new()),
        }))
    }

    /// Allocate a buffer holding a copy of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let buffer = Self::alloc(bytes.len());
        // SAFETY: fresh allocation of exactly bytes.len() bytes
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.as_ptr(), bytes.len()) };
        buffer
    }

    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    /// Stable address of the first byte
    pub fn address(&self) -> u64 {
        self.0.ptr.as_ptr() as usize as u64
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0.ptr.as_ptr()
    }

    /// Copy of the current contents
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        // SAFETY: the allocation is at least self.len() bytes
        unsafe { ptr::copy_nonoverlapping(self.as_ptr(), out.as_mut_ptr(), self.len()) };
        out
    }

    /// Region spanning the whole buffer
    pub fn region(&self) -> Region {
        Region {
            mem: Memory::Owned(self.clone()),
            offset: 0,
            len: self.len(),
        }
    }

    /// Keep `other` allocated while its address sits in the pointer slot at
    /// `offset`, replacing whatever the slot kept before
    ///
    /// A buffer never retains itself.
    pub fn retain_at(&self, offset: usize, other: NativeBuffer) {
        let mut kept = self.0.keep_alive.borrow_mut();
        if Rc::ptr_eq(&self.0, &other.0) {
            kept.remove(&offset);
        } else {
            kept.insert(offset, other);
        }
    }

    /// Buffer kept alive by the pointer slot at `offset`
    pub fn retained_at(&self, offset: usize) -> Option<NativeBuffer> {
        self.0.keep_alive.borrow().get(&offset).cloned()
    }

    /// Drop the keep-alive of every slot overlapping `[start, start + len)`
    pub fn release_range(&self, start: usize, len: usize) {
        if len == 0 {
            return;
        }
        let end = start.saturating_add(len);
        self.0
            .keep_alive
            .borrow_mut()
            .retain(|slot, _| !(*slot < end && slot + SLOT_WIDTH > start));
    }

    /// Number of buffers kept alive by this one
    pub fn retained_count(&self) -> usize {
        self.0.keep_alive.borrow().len()
    }

    /// Whether two handles share one allocation
    pub fn same_allocation(&self, other: &NativeBuffer) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("address", &format_args!("0x{:x}", self.address()))
            .field("len", &self.len())
            .field("retained", &self.retained_count())
            .finish()
    }
}

#[derive(Clone)]
enum Memory {
    Owned(NativeBuffer),
    Foreign { address: u64 },
}

/// Byte range a view reads and writes through
///
/// Every access is bounds-checked against the range; sub-ranges can only be
/// carved from inside it.
#[derive(Clone)]
pub struct Region {
    mem: Memory,
    offset: usize,
    len: usize,
}

impl Region {
    /// Region over memory this crate does not own
    ///
    /// # Safety
    ///
    /// `address` must point to at least `len` readable and writable bytes for
    /// as long as the region, or anything derived from it, is used.
    pub unsafe fn foreign(address: u64, len: usize) -> Self {
        Region {
            mem: Memory::Foreign { address },
            offset: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte of the range
    pub fn address(&self) -> u64 {
        self.base() + self.offset as u64
    }

    /// Owning buffer, `None` for foreign memory
    pub fn owner(&self) -> Option<&NativeBuffer> {
        match &self.mem {
            Memory::Owned(buffer) => Some(buffer),
            Memory::Foreign { .. } => None,
        }
    }

    /// Record that the pointer slot at `offset` holds `target`'s address
    ///
    /// No-op for foreign memory.
    pub fn keep_at(&self, offset: usize, target: NativeBuffer) {
        if let Memory::Owned(owner) = &self.mem {
            owner.retain_at(self.offset + offset, target);
        }
    }

    /// Buffer whose address was last stored in the pointer slot at `offset`
    /// and not overwritten since
    pub fn kept_at(&self, offset: usize) -> Option<NativeBuffer> {
        match &self.mem {
            Memory::Owned(owner) => owner.retained_at(self.offset + offset),
            Memory::Foreign { .. } => None,
        }
    }

    /// Sub-range `[offset, offset + len)` of this range
    pub fn sub(&self, offset: usize, len: usize) -> FfiResult<Region> {
        self.check(offset, len)?;
        Ok(Region {
            mem: self.mem.clone(),
            offset: self.offset + offset,
            len,
        })
    }

    /// Copy bytes out of the range
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) -> FfiResult<()> {
        self.check(offset, dst.len())?;
        // SAFETY: bounds checked above; owned memory is alive through self.mem,
        // foreign memory is covered by the contract of `Region::foreign`
        unsafe { ptr::copy_nonoverlapping(self.ptr_at(offset), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Fixed-size read
    pub fn read_array<const N: usize>(&self, offset: usize) -> FfiResult<[u8; N]> {
        let mut out = [0u8; N];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    /// Copy bytes into the range
    pub fn write_from(&self, offset: usize, src: &[u8]) -> FfiResult<()> {
        self.check(offset, src.len())?;
        // SAFETY: see read_into; src is a distinct Rust allocation
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.ptr_at(offset), src.len()) };
        self.release(offset, src.len());
        Ok(())
    }

    /// Zero the whole range
    pub fn clear(&self) {
        // SAFETY: the range itself is always in bounds
        unsafe { ptr::write_bytes(self.ptr_at(0), 0, self.len) };
        self.release(0, self.len);
    }

    /// Copy of the range contents
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        // SAFETY: the range itself is always in bounds
        unsafe { ptr::copy_nonoverlapping(self.ptr_at(0), out.as_mut_ptr(), self.len) };
        out
    }

    /// Slots of this range that keep a buffer alive, offsets relative to the
    /// range
    pub fn kept(&self) -> Vec<(usize, NativeBuffer)> {
        match &self.mem {
            Memory::Owned(owner) => owner
                .0
                .keep_alive
                .borrow()
                .range(self.offset..self.offset + self.len)
                .map(|(slot, kept)| (slot - self.offset, kept.clone()))
                .collect(),
            Memory::Foreign { .. } => Vec::new(),
        }
    }

    // Overwritten slots no longer hold the kept address
    fn release(&self, offset: usize, len: usize) {
        if let Memory::Owned(owner) = &self.mem {
            owner.release_range(self.offset + offset, len);
        }
    }

    fn base(&self) -> u64 {
        match &self.mem {
            Memory::Owned(buffer) => buffer.address(),
            Memory::Foreign { address } => *address,
        }
    }

    fn ptr_at(&self, offset: usize) -> *mut u8 {
        (self.address() as usize + offset) as *mut u8
    }

    fn check(&self, offset: usize, len: usize) -> FfiResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(FfiError::Bounds {
                needed: offset.saturating_add(len),
                available: self.len,
            }),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("address", &format_args!("0x{:x}", self.address()))
            .field("len", &self.len)
            .field("owned", &self.owner().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed_and_aligned() {
        let buffer = NativeBuffer::alloc(33);
        assert_eq!(buffer.len(), 33);
        assert_eq!(buffer.address() % BUFFER_ALIGN as u64, 0);
        assert!(buffer.to_vec().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_zero_length_buffer() {
        let buffer = NativeBuffer::alloc(0);
        assert!(buffer.is_empty());
        assert_ne!(buffer.address(), 0);
        assert!(buffer.region().to_vec().is_empty());
    }

    #[test]
    fn test_sub_region_aliases_parent() {
        let buffer = NativeBuffer::from_bytes(&[1, 2, 3, 4, 5, 6]);
        let region = buffer.region();
        let sub = region.sub(2, 3).unwrap();
        assert_eq!(sub.address(), buffer.address() + 2);
        sub.write_from(1, &[9]).unwrap();
        assert_eq!(buffer.to_vec(), vec![1, 2, 3, 9, 5, 6]);
    }

    #[test]
    fn test_out_of_range_access_is_rejected() {
        let region = NativeBuffer::alloc(4).region();
        assert!(matches!(
            region.read_array::<4>(1),
            Err(FfiError::Bounds {
                needed: 5,
                available: 4
            })
        ));
        assert!(region.sub(3, 2).is_err());
        assert!(region.sub(usize::MAX, 2).is_err());
        assert!(region.write_from(4, &[]).is_ok());
    }

    #[test]
    fn test_keep_alive_holds_allocation() {
        let holder = NativeBuffer::alloc(8);
        let text = NativeBuffer::from_bytes(b"hi\0");
        let address = text.address();
        holder.retain_at(0, text.clone());
        holder.retain_at(0, text.clone());
        drop(text);
        assert_eq!(holder.retained_count(), 1);
        // SAFETY: retained by holder
        let first = unsafe { *(address as usize as *const u8) };
        assert_eq!(first, b'h');
    }

    #[test]
    fn test_keep_alive_replaced_per_slot() {
        let holder = NativeBuffer::alloc(16);
        for _ in 0..1000 {
            holder.retain_at(8, NativeBuffer::alloc(4));
        }
        assert_eq!(holder.retained_count(), 1);
        holder.retain_at(8, holder.clone());
        assert_eq!(holder.retained_count(), 0);
    }

    #[test]
    fn test_overwriting_slot_bytes_releases_keep_alive() {
        let holder = NativeBuffer::alloc(24);
        let region = holder.region();
        region.keep_at(0, NativeBuffer::alloc(1));
        region.keep_at(8, NativeBuffer::alloc(1));
        region.keep_at(16, NativeBuffer::alloc(1));
        // One byte inside the middle slot
        region.write_from(12, &[0]).unwrap();
        assert!(holder.retained_at(0).is_some());
        assert!(holder.retained_at(8).is_none());
        assert!(holder.retained_at(16).is_some());

        region.sub(16, 8).unwrap().clear();
        assert_eq!(holder.retained_count(), 1);
    }

    #[test]
    fn test_mutual_references_released_by_overwrite() {
        let a = NativeBuffer::alloc(8);
        let b = NativeBuffer::alloc(8);
        a.region().keep_at(0, b.clone());
        b.region().keep_at(0, a.clone());
        assert_eq!((a.retained_count(), b.retained_count()), (1, 1));

        a.region().write_from(0, &0u64.to_le_bytes()).unwrap();
        assert_eq!((a.retained_count(), b.retained_count()), (0, 1));
    }

    #[test]
    fn test_foreign_region() {
        let mut backing = [0u8; 8];
        let region = unsafe { Region::foreign(backing.as_mut_ptr() as u64, backing.len()) };
        region.write_from(0, &7u32.to_le_bytes()).unwrap();
        assert!(region.owner().is_none());
        assert_eq!(region.read_array::<4>(0).unwrap(), 7u32.to_le_bytes());
        drop(region);
        assert_eq!(backing[0], 7);
    }
}
