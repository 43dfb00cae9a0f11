//! Physical frame arena and the frame table.
//!
//! The arena hands out zeroed page frames and records, for every frame it
//! manages, who currently owns it: nobody ([`OWNER_FREE`]), the hypervisor
//! itself ([`OWNER_HYPERVISOR`]), or a virtual processor (its non-zero
//! identifier). The ownership word is the frame-array entry the EPT
//! manager mutates whenever it attaches or detaches a leaf mapping, and it
//! is what makes frame conservation checkable: at any quiescent point the
//! frames attributed to a vproc are exactly its present EPT leaves.
//!
//! The arena is process-wide state with an explicit [`init`] at boot.

use crate::addressing::{Pa, Va, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use spin::Mutex;

/// Ownership word of a frame nobody holds.
pub const OWNER_FREE: u32 = u32::MAX;
/// Ownership word of a frame held by the hypervisor itself.
pub const OWNER_HYPERVISOR: u32 = 0;

struct FrameArena {
    /// First managed frame.
    base: Va,
    /// Number of managed frames.
    frames: usize,
    /// One ownership word per frame, carved out of the region head.
    meta: &'static mut [u32],
    /// Next-fit allocation cursor.
    cursor: usize,
}

impl FrameArena {
    fn index_of(&self, va: Va) -> Option<usize> {
        let (base, addr) = unsafe { (self.base.into_usize(), va.into_usize()) };
        if addr < base || addr >= base + self.frames * PAGE_SIZE {
            None
        } else {
            Some((addr - base) >> PAGE_SHIFT)
        }
    }

    fn alloc(&mut self) -> Option<Va> {
        for probe in 0..self.frames {
            let idx = (self.cursor + probe) % self.frames;
            if self.meta[idx] == OWNER_FREE {
                self.meta[idx] = OWNER_HYPERVISOR;
                self.cursor = idx + 1;
                let va = self.base + idx * PAGE_SIZE;
                unsafe {
                    core::slice::from_raw_parts_mut(va.into_usize() as *mut u64, PAGE_SIZE / 8)
                        .fill(0);
                }
                return Some(va);
            }
        }
        None
    }

    fn dealloc(&mut self, va: Va) {
        let idx = self.index_of(va).expect("freeing a frame outside the arena");
        assert_ne!(self.meta[idx], OWNER_FREE, "double free of {:?}", va);
        self.meta[idx] = OWNER_FREE;
    }
}

static ARENA: Mutex<Option<FrameArena>> = Mutex::new(None);

/// Foster the physical memory region `[start, end)` into the frame arena.
///
/// The first pages of the region are claimed for the per-frame ownership
/// table; the rest become allocatable frames.
///
/// # Safety
/// The region must be unused, linearly mapped memory. Must be called once,
/// at boot, before any allocation.
pub unsafe fn init(start: Va, end: Va) {
    let (start_addr, end_addr) = (
        (start.into_usize() + PAGE_MASK) & !PAGE_MASK,
        end.into_usize() & !PAGE_MASK,
    );
    assert!(end_addr > start_addr, "frame arena region is empty");

    // Split the region into the ownership table and the managed frames.
    let total_pages = (end_addr - start_addr) >> PAGE_SHIFT;
    let meta_bytes = total_pages * core::mem::size_of::<u32>();
    let meta_pages = (meta_bytes + PAGE_MASK) >> PAGE_SHIFT;
    let frames = total_pages - meta_pages;

    let meta = core::slice::from_raw_parts_mut(start_addr as *mut u32, frames);
    meta.fill(OWNER_FREE);

    let mut guard = ARENA.lock();
    assert!(guard.is_none(), "frame arena initialized twice");
    *guard = Some(FrameArena {
        base: Va::new(start_addr + meta_pages * PAGE_SIZE).unwrap(),
        frames,
        meta,
        cursor: 0,
    });
}

fn with_arena<R>(f: impl FnOnce(&mut FrameArena) -> R) -> R {
    let mut guard = ARENA.lock();
    f(guard.as_mut().expect("frame arena is not initialized"))
}

/// Attribute the frame at `pa` to `owner`.
///
/// Panics if the frame is not allocated; a free frame has no owner to
/// reassign.
pub fn attribute(pa: Pa, owner: u32) {
    with_arena(|arena| {
        let idx = arena
            .index_of(pa.into_va())
            .expect("attributing a frame outside the arena");
        assert_ne!(arena.meta[idx], OWNER_FREE, "attributing a free frame");
        arena.meta[idx] = owner;
    })
}

/// Current owner of the frame at `pa`, or `None` outside the arena.
pub fn owner_of(pa: Pa) -> Option<u32> {
    with_arena(|arena| arena.index_of(pa.into_va()).map(|idx| arena.meta[idx]))
}

/// Number of frames currently attributed to `owner`.
pub fn owned_frames(owner: u32) -> usize {
    with_arena(|arena| arena.meta.iter().filter(|m| **m == owner).count())
}

/// An owned, page-sized, zero-initialized physical frame.
pub struct Page {
    va: Va,
}

impl Page {
    /// Allocate a page. `None` when the arena is exhausted.
    #[inline]
    pub fn new() -> Option<Self> {
        with_arena(|arena| arena.alloc()).map(|va| Page { va })
    }

    /// Get virtual address of this page.
    #[inline]
    pub fn va(&self) -> Va {
        self.va
    }

    /// Get physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.va.into_pa()
    }

    /// Consume the page, returning its physical address.
    ///
    /// The caller becomes responsible for the frame and must eventually
    /// rebuild a `Page` through [`Page::from_pa`] to release it.
    #[inline]
    pub fn into_raw(self) -> Pa {
        core::mem::ManuallyDrop::new(self).pa()
    }

    /// Reconstruct a page from a physical address.
    ///
    /// # Safety
    /// `pa` must come from [`Page::into_raw`] and must not be rebuilt
    /// twice; otherwise the frame is double-freed.
    #[inline]
    pub unsafe fn from_pa(pa: Pa) -> Self {
        Page { va: pa.into_va() }
    }

    /// Get reference of the underlying bytes.
    ///
    /// # Safety
    /// The caller must not hold a mutable view of the same frame.
    pub unsafe fn inner(&self) -> &[u8] {
        core::slice::from_raw_parts(self.va.into_usize() as *const u8, PAGE_SIZE)
    }

    /// Get mutable reference of the underlying bytes.
    ///
    /// # Safety
    /// The caller must hold the only view of the frame.
    pub unsafe fn inner_mut(&mut self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.va.into_usize() as *mut u8, PAGE_SIZE)
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        with_arena(|arena| arena.dealloc(self.va));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn init_for_tests() {
        static ONCE: spin::Once<()> = spin::Once::new();
        ONCE.call_once(|| {
            let backing = Box::leak(vec![0u8; 4 << 20].into_boxed_slice());
            let start = Va::new(backing.as_ptr() as usize).unwrap();
            let end = Va::new(backing.as_ptr() as usize + backing.len()).unwrap();
            unsafe { init(start, end) };
        });
    }

    #[test]
    fn alloc_zeroed_and_tracked() {
        init_for_tests();
        let pg = Page::new().unwrap();
        assert!(unsafe { pg.inner() }.iter().all(|b| *b == 0));
        assert_eq!(owner_of(pg.pa()), Some(OWNER_HYPERVISOR));

        attribute(pg.pa(), 7);
        assert_eq!(owner_of(pg.pa()), Some(7));
        assert_eq!(owned_frames(7), 1);

        let pa = pg.pa();
        drop(pg);
        assert_eq!(owner_of(pa), Some(OWNER_FREE));
        assert_eq!(owned_frames(7), 0);
    }

    #[test]
    fn raw_round_trip_preserves_frame() {
        init_for_tests();
        let pg = Page::new().unwrap();
        let pa = pg.into_raw();
        assert_eq!(owner_of(pa), Some(OWNER_HYPERVISOR));
        drop(unsafe { Page::from_pa(pa) });
        assert_eq!(owner_of(pa), Some(OWNER_FREE));
    }
}
