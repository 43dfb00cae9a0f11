//! Guest address-space probing.

use crate::vm::{Gpa, Gva};
use bedrock::addressing::{Pa, Va, PAGE_MASK};

/// Present bit of a guest page-table entry.
const PTE_PRESENT: u64 = 1 << 0;
/// Page-size bit of a guest directory entry.
const PTE_HUGE: u64 = 1 << 7;
const PTE_ADDR: u64 = 0x000f_ffff_ffff_f000;

/// Traits to probe a vproc's address space.
pub trait Probe {
    /// Translate a guest-physical address to a host-physical address.
    fn gpa2hpa(&self, gpa: Gpa) -> Option<Pa>;

    /// Translate a guest-physical address to a host-virtual address.
    #[inline]
    fn gpa2hva(&self, gpa: Gpa) -> Option<Va> {
        self.gpa2hpa(gpa).map(|pa| pa.into_va())
    }

    /// Translate a guest-virtual address to a host-physical address by
    /// walking the guest's own page tables rooted at `cr3`.
    ///
    /// 2 MiB pages terminate the walk at the directory level; x86 cannot
    /// always avoid them during early guest boot.
    fn gva2hpa(&self, cr3: u64, gva: Gva) -> Option<Pa> {
        let addr = unsafe { gva.into_usize() } as u64;
        let mut table_gpa = cr3 & PTE_ADDR;
        for level in (1..=3).rev() {
            let entry = self.read_guest_entry(table_gpa, (addr >> (12 + 9 * level)) & 0x1ff)?;
            if entry & PTE_PRESENT == 0 {
                return None;
            }
            if level == 1 && entry & PTE_HUGE != 0 {
                let base = entry & PTE_ADDR & !0x1f_ffff;
                return self.gpa2hpa(Gpa::new((base | (addr & 0x1f_ffff)) as usize)?);
            }
            table_gpa = entry & PTE_ADDR;
        }
        let entry = self.read_guest_entry(table_gpa, (addr >> 12) & 0x1ff)?;
        if entry & PTE_PRESENT == 0 {
            return None;
        }
        self.gpa2hpa(Gpa::new(
            ((entry & PTE_ADDR) | (addr & PAGE_MASK as u64)) as usize,
        )?)
    }

    /// Translate a guest-virtual address to a host-virtual address.
    #[inline]
    fn gva2hva(&self, cr3: u64, gva: Gva) -> Option<Va> {
        self.gva2hpa(cr3, gva).map(|pa| pa.into_va())
    }

    #[doc(hidden)]
    fn read_guest_entry(&self, table_gpa: u64, index: u64) -> Option<u64> {
        let hva = self.gpa2hva(Gpa::new(table_gpa as usize)?)?;
        Some(unsafe {
            core::ptr::read((hva.into_usize() as *const u64).add(index as usize))
        })
    }
}
