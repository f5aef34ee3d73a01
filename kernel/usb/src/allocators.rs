//! Memory shared with the USB controller
//!
//! The controller reaches memory through 32-bit physical addresses while the
//! driver works through virtual mappings. Every structure the controller reads
//! lives in a [`DmaRegion`] that remembers both, so a slot can be turned into
//! the address the hardware needs ([`DmaArray::address_of`]) and an address
//! read back from the hardware can be turned into a slot ([`DmaArray::find`]).
//!
//! [`SlotPool`] builds fixed-capacity descriptor pools on top of [`DmaArray`]:
//! ```ignore
//! // 50 endpoint descriptors, handed out by slot
//! let mut eds = SlotPool::<EndpointDescriptor>::new("EdPool", &dma, 50)?;
//! let (slot, phys) = eds.allocate()?;
//! assert_eq!(eds.find(phys)?, slot);
//! ```

use super::*;
use alloc::{sync::Arc, vec, vec::Vec};
use core::{
    alloc::Layout,
    any::TypeId,
    marker::PhantomData,
    mem::{align_of, size_of},
    ops::{Deref, DerefMut},
    ptr::NonNull,
};
use log::error;
use zerocopy::{FromBytes, FromZeroes};

/// A physical address as seen by the controller.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct UsbPointer(pub u32);

impl UsbPointer {
    pub const NULL: UsbPointer = UsbPointer(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn offset(self, bytes: usize) -> UsbPointer {
        UsbPointer(self.0.wrapping_add(bytes as u32))
    }
}

/// A block of memory visible to both the driver and the controller.
#[derive(Debug)]
pub struct DmaRegion {
    virt: NonNull<u8>,
    phys: UsbPointer,
    layout: Layout,
}

// The region is plain memory; ownership of it moves with the value.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// # Safety
    /// `virt` must point to `layout.size()` writable bytes aligned to
    /// `layout.align()`, which the controller reaches at `phys`. The memory must
    /// stay valid until the region is handed back to its allocator.
    pub unsafe fn new(virt: NonNull<u8>, phys: UsbPointer, layout: Layout) -> DmaRegion {
        DmaRegion { virt, phys, layout }
    }

    pub fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    pub fn phys(&self) -> UsbPointer {
        self.phys
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }
}

/// Hands out memory the controller can reach with 32-bit addresses.
pub trait DmaAllocator: Send + Sync {
    /// Returns `layout.size()` bytes aligned to `layout.align()` in both
    /// address spaces, or `None` if no such memory is left.
    fn allocate(&self, layout: Layout) -> Option<DmaRegion>;

    /// Takes back a region returned by [`allocate`](DmaAllocator::allocate).
    fn free(&self, region: DmaRegion);
}

/// A field of a structure the controller may read or write at any time.
///
/// Accesses are volatile so the compiler neither caches nor elides them.
#[derive(FromZeroes, FromBytes)]
#[repr(transparent)]
pub struct DmaCell<T>(T);

impl<T: Copy> DmaCell<T> {
    pub fn read(&self) -> T {
        unsafe { core::ptr::read_volatile(&self.0) }
    }

    pub fn write(&mut self, value: T) {
        unsafe { core::ptr::write_volatile(&mut self.0, value) }
    }
}

/// A zero-initialized array of `T` in DMA memory, freed on drop.
pub(crate) struct DmaArray<T: FromBytes> {
    virt: NonNull<T>,
    phys: UsbPointer,
    layout: Layout,
    len: usize,
    allocator: Arc<dyn DmaAllocator>,
    _marker: PhantomData<T>,
}

unsafe impl<T: FromBytes + Send> Send for DmaArray<T> {}

impl<T: FromBytes> DmaArray<T> {
    pub fn new(allocator: &Arc<dyn DmaAllocator>, len: usize) -> Result<DmaArray<T>, UsbError> {
        Self::with_align(allocator, len, align_of::<T>())
    }

    /// Like [`new`](Self::new) but with the start aligned to at least `align` bytes.
    pub fn with_align(allocator: &Arc<dyn DmaAllocator>, len: usize, align: usize) -> Result<DmaArray<T>, UsbError> {
        let size = size_of::<T>().checked_mul(len.max(1)).ok_or(UsbError::DmaAllocation)?;
        let layout = Layout::from_size_align(size, align.max(align_of::<T>())).map_err(|_| UsbError::DmaAllocation)?;
        let region = allocator.allocate(layout).ok_or(UsbError::DmaAllocation)?;
        // the allocator may hand out dirty memory
        unsafe { core::ptr::write_bytes(region.virt.as_ptr(), 0, layout.size()) };

        Ok(DmaArray {
            virt: region.virt.cast(),
            phys: region.phys,
            layout,
            len,
            allocator: allocator.clone(),
            _marker: PhantomData,
        })
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr(), self.len) }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(index)
    }

    /// Physical address of the first element.
    pub fn address(&self) -> UsbPointer {
        self.phys
    }

    pub fn address_of(&self, index: usize) -> Option<UsbPointer> {
        (index < self.len).then(|| self.phys.offset(index * size_of::<T>()))
    }

    /// Index of the element starting at physical address `addr`.
    pub fn find(&self, addr: UsbPointer) -> Option<usize> {
        let offset = addr.0.checked_sub(self.phys.0)? as usize;
        let index = offset / size_of::<T>();
        let valid_offset = offset % size_of::<T>() == 0;
        let valid_index = index < self.len;
        (valid_offset && valid_index).then_some(index)
    }
}

impl<T: FromBytes> Drop for DmaArray<T> {
    fn drop(&mut self) {
        let region = unsafe { DmaRegion::new(self.virt.cast(), self.phys, self.layout) };
        self.allocator.free(region);
    }
}

/// A single zero-initialized `T` in DMA memory.
pub(crate) struct DmaBox<T: FromBytes>(DmaArray<T>);

impl<T: FromBytes> DmaBox<T> {
    pub fn new(allocator: &Arc<dyn DmaAllocator>) -> Result<DmaBox<T>, UsbError> {
        DmaArray::new(allocator, 1).map(DmaBox)
    }

    pub fn address(&self) -> UsbPointer {
        self.0.address()
    }
}

impl<T: FromBytes> Deref for DmaBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.0.virt.as_ptr() }
    }
}

impl<T: FromBytes> DerefMut for DmaBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.0.virt.as_ptr() }
    }
}

/// Designates a slot of a [`SlotPool`], tagged with the pooled type.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) struct AllocSlot(pub(crate) usize, pub(crate) TypeId);

impl AllocSlot {
    pub fn index(&self) -> usize {
        self.0
    }

    pub fn check<T: 'static>(&self) -> Result<(), UsbError> {
        match TypeId::of::<T>() == self.1 {
            true => Ok(()),
            false => Err(UsbError::UnknownHandle),
        }
    }
}

/// A fixed number of `T` slots in DMA memory, handed out one at a time.
pub(crate) struct SlotPool<T: FromBytes + 'static> {
    name: &'static str,
    slots: DmaArray<T>,
    occupied: Vec<bool>,
}

impl<T: FromBytes + 'static> SlotPool<T> {
    pub fn new(name: &'static str, allocator: &Arc<dyn DmaAllocator>, capacity: usize) -> Result<SlotPool<T>, UsbError> {
        Ok(SlotPool { name, slots: DmaArray::new(allocator, capacity)?, occupied: vec![false; capacity] })
    }

    /// Takes the first free slot and zeroes it.
    pub fn allocate(&mut self) -> Result<(AllocSlot, UsbPointer), UsbError> {
        let Some(index) = self.occupied.iter().position(|occupied| !occupied) else {
            error!("{}: Out of slots", self.name);
            return Err(UsbError::OutOfDescriptors);
        };
        self.occupied[index] = true;

        self.slots.get_mut(index).ok_or(UsbError::UnknownHandle)?.zero();

        let addr = self.slots.address_of(index).ok_or(UsbError::UnknownHandle)?;
        Ok((AllocSlot(index, TypeId::of::<T>()), addr))
    }

    pub fn free(&mut self, slot: AllocSlot) -> Result<(), UsbError> {
        slot.check::<T>()?;
        match self.occupied.get_mut(slot.0) {
            Some(occupied) if *occupied => {
                *occupied = false;
                Ok(())
            }
            _ => {
                error!("{}: Invalid slot key {}", self.name, slot.0);
                Err(UsbError::UnknownHandle)
            }
        }
    }

    pub fn get(&self, slot: AllocSlot) -> Result<&T, UsbError> {
        slot.check::<T>()?;
        self.slots.get(slot.0).ok_or(UsbError::UnknownHandle)
    }

    pub fn get_mut(&mut self, slot: AllocSlot) -> Result<&mut T, UsbError> {
        slot.check::<T>()?;
        self.slots.get_mut(slot.0).ok_or(UsbError::UnknownHandle)
    }

    pub fn find(&self, addr: UsbPointer) -> Result<AllocSlot, UsbError> {
        self.slots.find(addr).map(|index| AllocSlot(index, TypeId::of::<T>())).ok_or(UsbError::UnknownHandle)
    }

    pub fn address_of(&self, slot: AllocSlot) -> Result<UsbPointer, UsbError> {
        slot.check::<T>()?;
        self.slots.address_of(slot.0).ok_or(UsbError::UnknownHandle)
    }

    pub fn in_use(&self) -> usize {
        self.occupied.iter().filter(|occupied| **occupied).count()
    }
}
