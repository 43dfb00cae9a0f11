//! Memory addressing.
//!
//! The hypervisor maps kernel virtual memory linearly onto physical memory:
//! the first page of the linear window corresponds to the first frame, the
//! second page to the second frame, and so on. Translating between the two
//! is adding or subtracting a constant offset.
//!
//! The offset is installed once by the boot path through
//! [`set_linear_map_offset`]; before that (and in host-side tests) the map
//! is the identity.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;

static LINEAR_MAP_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Install the virtual-to-physical offset of the kernel linear map.
///
/// # Safety
/// Must be called exactly once, during early boot, before any [`Pa`] is
/// turned into a [`Va`].
pub unsafe fn set_linear_map_offset(offset: usize) {
    LINEAR_MAP_OFFSET.store(offset, Ordering::SeqCst);
}

#[inline]
fn linear_map_offset() -> usize {
    LINEAR_MAP_OFFSET.load(Ordering::Relaxed)
}

/// Physical address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// PA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new physical address with a check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const unsafe fn into_usize(self) -> usize {
        self.0
    }

    /// Frame number of this address.
    #[inline]
    pub const fn pfn(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Cast into virtual address through the linear map.
    #[inline]
    pub fn into_va(self) -> Va {
        Va(self.0 + linear_map_offset())
    }
}

/// Virtual address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Va(usize);

impl Va {
    /// Create a new canonical virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast into usize.
    #[inline]
    pub const unsafe fn into_usize(self) -> usize {
        self.0
    }

    /// Cast into physical address through the linear map.
    #[inline]
    pub fn into_pa(self) -> Pa {
        Pa(self.0 - linear_map_offset())
    }

    /// Get reference of T underlying the Va.
    ///
    /// # Safety
    /// The address must be properly aligned, dereferenceable, and point to
    /// an initialized instance of `T`.
    #[inline]
    pub unsafe fn as_ref<'a, T>(&self) -> Option<&'a T> {
        (self.into_usize() as *const T).as_ref()
    }

    /// Get mutable reference of T underlying the Va.
    ///
    /// # Safety
    /// Same as [`Va::as_ref`], plus the usual aliasing rules.
    #[inline]
    pub unsafe fn as_mut<'a, T>(&self) -> Option<&'a mut T> {
        (self.into_usize() as *mut T).as_mut()
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::BitOr<usize> for $t {
            type Output = Self;

            fn bitor(self, other: usize) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}

impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
