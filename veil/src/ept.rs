//! Extended page table manager.
//!
//! One `ExtendedPageTable` owns the guest-physical to host-physical
//! translation tree of one vproc. The tree is a four-level radix of
//! page-sized nodes; the nodes live in a first-class arena indexed by
//! frame number, and every cross-reference a software walk follows goes
//! through that arena; entries carry host-physical addresses only for the
//! hardware walker.
//!
//! Leaf attach and detach keep the frame table honest: a data frame mapped
//! into the tree is attributed to the owning vproc, and detaching it (or
//! replacing it through the destructive upsert) hands it back to the
//! allocator and clears the attribution.

use alloc::collections::BTreeMap;
use bedrock::addressing::{Pa, Va, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use bedrock::mm::{self, Page, OWNER_HYPERVISOR};

use crate::vm::Gpa;

/// Bits of an EPT entry holding the host-physical address.
const ADDR_MASK: usize = 0x000f_ffff_ffff_f000;

/// One level-4 entry spans 512 GiB; the whole guest-physical space of a
/// vproc must fit under a single one.
pub const GUEST_SPACE_LIMIT: usize = 1 << 39;

#[derive(Debug, PartialEq, Eq)]
pub enum EptMappingError {
    /// Unaligned address.
    Unaligned,
    /// No mapping exists.
    NotExist,
    /// The mapped frame is not owned by this tree (pass-through).
    Foreign,
    /// The frame arena is exhausted.
    Exhausted,
}

bitflags::bitflags! {
    /// Access permissions of a mapping.
    pub struct Permission: usize {
        /// Reads are allowed.
        const READ = 1 << 0;
        /// Writes are allowed.
        const WRITE = 1 << 1;
        /// Instruction fetches are allowed.
        const EXECUTABLE = 1 << 2;
    }
}

/// Memory type installed in a leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Normal write-back RAM.
    WriteBack,
    /// Device memory; every access reaches the bus.
    Uncached,
}

impl CachePolicy {
    /// Leaf-entry bits 5:3 (memory type) plus bit 6 (ignore guest PAT).
    fn bits(self) -> usize {
        match self {
            CachePolicy::WriteBack => (6 << 3) | (1 << 6),
            CachePolicy::Uncached => 1 << 6,
        }
    }

    fn from_entry(raw: usize) -> Self {
        if (raw >> 3) & 0x7 == 6 {
            CachePolicy::WriteBack
        } else {
            CachePolicy::Uncached
        }
    }
}

/// An entry of any EPT level.
///
/// An entry is present exactly when at least one of its permission bits is
/// set; a zero entry is the "not mapped" sentinel.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct EptEntry(usize);

impl EptEntry {
    const EMPTY: Self = Self(0);

    #[inline]
    pub fn is_present(&self) -> bool {
        self.0 & Permission::all().bits() != 0
    }

    /// Host-physical address this entry points at, when present.
    #[inline]
    pub fn pa(&self) -> Option<Pa> {
        if self.is_present() {
            Pa::new(self.0 & ADDR_MASK)
        } else {
            None
        }
    }

    /// Permission bits of this entry.
    #[inline]
    pub fn permission(&self) -> Permission {
        Permission::from_bits_truncate(self.0)
    }

    /// Memory type of this leaf entry.
    #[inline]
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy::from_entry(self.0)
    }

    #[inline]
    fn set(&mut self, pa: Pa, bits: usize) {
        self.0 = (unsafe { pa.into_usize() } & ADDR_MASK) | bits;
    }
}

/// Index of `gpa` at `level` (3 = level-4 table, 0 = leaf table).
#[inline]
fn table_index(gpa: usize, level: usize) -> usize {
    (gpa >> (PAGE_SHIFT + 9 * level)) & 0x1ff
}

unsafe fn table_of<'a>(va: Va) -> &'a mut [EptEntry; 512] {
    &mut *(va.into_usize() as *mut [EptEntry; 512])
}

/// Guest-physical to host-physical translation tree of one vproc.
pub struct ExtendedPageTable {
    /// Frame-table owner word for leaf frames of this tree.
    owner: u32,
    root: Page,
    /// Intermediate nodes, indexed by their frame number.
    nodes: BTreeMap<usize, Page>,
}

impl ExtendedPageTable {
    /// Create an empty tree whose data frames are attributed to `owner`.
    pub fn new(owner: u32) -> Self {
        Self {
            owner,
            root: Page::new().expect("out of frames for EPT root"),
            nodes: BTreeMap::new(),
        }
    }

    /// Host-physical address of the level-4 table.
    pub fn root_pa(&self) -> Pa {
        self.root.pa()
    }

    /// The EPT-pointer value hardware wants: root address, 4-level walk,
    /// write-back paging-structure memory type.
    pub fn eptp(&self) -> u64 {
        unsafe { self.root_pa().into_usize() as u64 | (3 << 3) | 6 }
    }

    fn node_va(&self, pa: Pa) -> Va {
        if pa == self.root.pa() {
            return self.root.va();
        }
        self.nodes
            .get(&pa.pfn())
            .map(|pg| pg.va())
            .expect("EPT node missing from arena")
    }

    /// Map the owned page `pg` at `gpa`.
    pub fn map(
        &mut self,
        gpa: Gpa,
        pg: Page,
        perm: Permission,
        policy: CachePolicy,
    ) -> Result<(), EptMappingError> {
        let pa = pg.into_raw();
        mm::attribute(pa, self.owner);
        unsafe { self.map_page(gpa, pa, perm, policy) }
    }

    /// Map the raw host-physical address `hpa` at `gpa`.
    ///
    /// This is the destructive upsert behind MMIO pass-through and DMA
    /// redirection: missing intermediate nodes are materialized, and a
    /// *different* frame previously mapped at `gpa` is returned to the
    /// allocator (attribution cleared) before the new mapping lands.
    ///
    /// # Safety
    /// `hpa` must stay valid for as long as the mapping exists; ownership
    /// of arena frames must have been settled by the caller.
    pub unsafe fn map_page(
        &mut self,
        gpa: Gpa,
        hpa: Pa,
        perm: Permission,
        policy: CachePolicy,
    ) -> Result<(), EptMappingError> {
        let (gpa_raw, hpa_raw) = (gpa.into_usize(), hpa.into_usize());
        if gpa_raw & PAGE_MASK != 0 || hpa_raw & PAGE_MASK != 0 {
            return Err(EptMappingError::Unaligned);
        }
        if perm.is_empty() {
            return Err(EptMappingError::NotExist);
        }

        let mut table = table_of(self.root.va());
        for level in (1..=3).rev() {
            let entry = &mut table[table_index(gpa_raw, level)];
            let next_pa = match entry.pa() {
                Some(pa) => pa,
                None => {
                    let node = Page::new().ok_or(EptMappingError::Exhausted)?;
                    let pa = node.pa();
                    self.nodes.insert(pa.pfn(), node);
                    entry.set(pa, Permission::all().bits());
                    pa
                }
            };
            table = table_of(self.node_va(next_pa));
        }

        let leaf = &mut table[table_index(gpa_raw, 0)];
        if let Some(old) = leaf.pa() {
            if old != hpa {
                self.release_frame(old);
            }
        }
        leaf.set(hpa, perm.bits() | policy.bits());
        Ok(())
    }

    /// Translate `gpa`. `None` is the "not mapped" sentinel.
    pub fn walk(&self, gpa: Gpa) -> Option<Pa> {
        self.walk_entry(gpa)
            .and_then(|e| e.pa())
            .map(|pa| pa + (unsafe { gpa.into_usize() } & PAGE_MASK))
    }

    /// Translate `gpa` and report the installed permission and policy.
    pub fn walk_flags(&self, gpa: Gpa) -> Option<(Pa, Permission, CachePolicy)> {
        self.walk_entry(gpa)
            .filter(|e| e.is_present())
            .map(|e| (e.pa().unwrap(), e.permission(), e.cache_policy()))
    }

    /// Run `f` over the frame backing `gpa` through a temporary host
    /// mapping; the mapping is released when `f` returns. The slice starts
    /// at `gpa`'s offset within its page.
    pub fn with_page<R>(
        &self,
        gpa: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, EptMappingError> {
        let page_gpa = Gpa::new(gpa & !PAGE_MASK).ok_or(EptMappingError::NotExist)?;
        let pa = self.walk(page_gpa).ok_or(EptMappingError::NotExist)?;
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(pa.into_va().into_usize() as *mut u8, PAGE_SIZE)
        };
        Ok(f(&mut bytes[gpa & PAGE_MASK..]))
    }

    /// Copy `bytes` into guest-physical memory starting at `gpa`.
    pub fn write_bytes(&self, gpa: usize, bytes: &[u8]) -> Result<(), EptMappingError> {
        let mut done = 0;
        while done < bytes.len() {
            let at = gpa + done;
            let chunk = (PAGE_SIZE - (at & PAGE_MASK)).min(bytes.len() - done);
            self.with_page(at, |dst| {
                dst[..chunk].copy_from_slice(&bytes[done..done + chunk])
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Read guest-physical memory starting at `gpa`.
    pub fn read_bytes(&self, gpa: usize, out: &mut [u8]) -> Result<(), EptMappingError> {
        let mut done = 0;
        while done < out.len() {
            let at = gpa + done;
            let chunk = (PAGE_SIZE - (at & PAGE_MASK)).min(out.len() - done);
            self.with_page(at, |src| {
                out[done..done + chunk].copy_from_slice(&src[..chunk])
            })?;
            done += chunk;
        }
        Ok(())
    }

    fn walk_entry(&self, gpa: Gpa) -> Option<EptEntry> {
        let gpa_raw = unsafe { gpa.into_usize() } & !PAGE_MASK;
        let mut table = unsafe { table_of(self.root.va()) };
        for level in (1..=3).rev() {
            let entry = table[table_index(gpa_raw, level)];
            table = unsafe { table_of(self.node_va(entry.pa()?)) };
        }
        Some(table[table_index(gpa_raw, 0)])
    }

    /// Detach the mapping at `gpa` and return the frame it held.
    ///
    /// Intermediate nodes left with zero live entries are reclaimed
    /// eagerly on the way out.
    pub fn unmap(&mut self, gpa: Gpa) -> Result<Page, EptMappingError> {
        let gpa_raw = unsafe { gpa.into_usize() };
        if gpa_raw & PAGE_MASK != 0 {
            return Err(EptMappingError::Unaligned);
        }

        // Walk down, remembering the node of every level for the pruning
        // pass back up.
        let mut path: [Option<Pa>; 3] = [None; 3];
        let mut table = unsafe { table_of(self.root.va()) };
        for level in (1..=3).rev() {
            let entry = table[table_index(gpa_raw, level)];
            let pa = entry.pa().ok_or(EptMappingError::NotExist)?;
            path[level - 1] = Some(pa);
            table = unsafe { table_of(self.node_va(pa)) };
        }

        let leaf = &mut table[table_index(gpa_raw, 0)];
        let pa = leaf.pa().ok_or(EptMappingError::NotExist)?;
        if mm::owner_of(pa) != Some(self.owner) {
            return Err(EptMappingError::Foreign);
        }
        *leaf = EptEntry::EMPTY;
        mm::attribute(pa, OWNER_HYPERVISOR);
        let page = unsafe { Page::from_pa(pa) };

        // Prune empty tables bottom-up; the root is never reclaimed.
        for level in 1..=3 {
            let node_pa = path[level - 1].unwrap();
            let empty = unsafe { table_of(self.node_va(node_pa)) }
                .iter()
                .all(|e| !e.is_present());
            if !empty {
                break;
            }
            self.nodes.remove(&node_pa.pfn());
            let parent_va = if level == 3 {
                self.root.va()
            } else {
                self.node_va(path[level].unwrap())
            };
            (unsafe { table_of(parent_va) })[table_index(gpa_raw, level)] = EptEntry::EMPTY;
        }
        Ok(page)
    }

    /// Number of present leaf mappings.
    pub fn mapped_pages(&self) -> usize {
        let mut count = 0;
        self.visit_leaves(|_, _| count += 1);
        count
    }

    fn visit_leaves(&self, mut f: impl FnMut(usize, EptEntry)) {
        let root = unsafe { table_of(self.root.va()) };
        for (i4, e4) in root.iter().enumerate() {
            let Some(pa4) = e4.pa() else { continue };
            let t3 = unsafe { table_of(self.node_va(pa4)) };
            for (i3, e3) in t3.iter().enumerate() {
                let Some(pa3) = e3.pa() else { continue };
                let t2 = unsafe { table_of(self.node_va(pa3)) };
                for (i2, e2) in t2.iter().enumerate() {
                    let Some(pa2) = e2.pa() else { continue };
                    let t1 = unsafe { table_of(self.node_va(pa2)) };
                    for (i1, e1) in t1.iter().enumerate() {
                        if e1.is_present() {
                            let gpa = (i4 << 39) | (i3 << 30) | (i2 << 21) | (i1 << 12);
                            f(gpa, *e1);
                        }
                    }
                }
            }
        }
    }

    /// Return every owned leaf frame to the allocator and drop every
    /// intermediate node. A tree with zero present entries still releases
    /// its own nodes, exactly once.
    pub fn release_frames(&mut self) {
        let mut leaves = alloc::vec::Vec::new();
        self.visit_leaves(|_, e| leaves.push(e.pa().unwrap()));
        for pa in leaves {
            self.release_frame(pa);
        }
        unsafe { table_of(self.root.va()) }.fill(EptEntry::EMPTY);
        self.nodes.clear();
    }

    /// Tear the tree down and flush every translation derived from it.
    ///
    /// EPT structures are cacheable, so a global write-back is required
    /// before the freed frames can be reused.
    pub fn free(mut self) {
        self.release_frames();
        unsafe {
            bedrock::intrinsics::invept_global();
            bedrock::intrinsics::wbinvd();
        }
    }

    fn release_frame(&mut self, pa: Pa) {
        if mm::owner_of(pa) == Some(self.owner) {
            mm::attribute(pa, OWNER_HYPERVISOR);
            drop(unsafe { Page::from_pa(pa) });
        }
    }
}

impl crate::probe::Probe for ExtendedPageTable {
    fn gpa2hpa(&self, gpa: Gpa) -> Option<Pa> {
        self.walk(gpa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::init_mm;

    fn check_insert_one(ept: &mut ExtendedPageTable, gpa: usize, perm: Permission) {
        let gpa = Gpa::new(gpa).unwrap();
        let pg = Page::new().unwrap();
        let pa = pg.pa();
        assert!(ept.map(gpa, pg, perm, CachePolicy::WriteBack).is_ok());
        let (walked, walked_perm, policy) = ept.walk_flags(gpa).unwrap();
        assert_eq!(walked, pa);
        assert_eq!(walked_perm, perm);
        assert_eq!(policy, CachePolicy::WriteBack);
    }

    fn check_remove_one(ept: &mut ExtendedPageTable, gpa: usize) {
        let gpa = Gpa::new(gpa).unwrap();
        assert!(ept.unmap(gpa).is_ok());
        assert_eq!(ept.walk(gpa), None);
    }

    #[test]
    fn round_trip_and_sentinel() {
        init_mm();
        let mut ept = ExtendedPageTable::new(0xA1);
        check_insert_one(&mut ept, 0x123_4000, Permission::READ | Permission::WRITE);
        assert_eq!(ept.walk(Gpa::new(0x123_5000).unwrap()), None);
        // Sub-page offsets survive translation.
        let full = ept.walk(Gpa::new(0x123_4123).unwrap()).unwrap();
        let base = ept.walk(Gpa::new(0x123_4000).unwrap()).unwrap();
        assert_eq!(full, base + 0x123);
        check_remove_one(&mut ept, 0x123_4000);
        ept.release_frames();
    }

    #[test]
    fn unaligned_and_missing_are_rejected() {
        init_mm();
        let mut ept = ExtendedPageTable::new(0xA2);
        assert_eq!(
            ept.map(
                Gpa::new(0x1234).unwrap(),
                Page::new().unwrap(),
                Permission::READ,
                CachePolicy::WriteBack,
            ),
            Err(EptMappingError::Unaligned)
        );
        assert_eq!(
            ept.unmap(Gpa::new(0x8000).unwrap()).map(|_| ()),
            Err(EptMappingError::NotExist)
        );
        ept.release_frames();
    }

    #[test]
    fn destructive_upsert_releases_replaced_frame() {
        init_mm();
        let owner = 0xA3;
        let mut ept = ExtendedPageTable::new(owner);
        let gpa = Gpa::new(0x40_0000).unwrap();

        let first = Page::new().unwrap();
        let first_pa = first.pa();
        ept.map(gpa, first, Permission::all(), CachePolicy::WriteBack)
            .unwrap();
        assert_eq!(mm::owner_of(first_pa), Some(owner));

        let second = Page::new().unwrap();
        let second_pa = second.pa();
        ept.map(gpa, second, Permission::all(), CachePolicy::WriteBack)
            .unwrap();

        assert_eq!(ept.walk(gpa), Some(second_pa));
        assert_eq!(mm::owner_of(first_pa), Some(mm::OWNER_FREE));
        assert_eq!(mm::owned_frames(owner), 1);
        ept.release_frames();
    }

    #[test]
    fn frame_conservation() {
        init_mm();
        let owner = 0xA4;
        let mut ept = ExtendedPageTable::new(owner);
        for i in 0..16 {
            let pg = Page::new().unwrap();
            ept.map(
                Gpa::new(i * 0x1000).unwrap(),
                pg,
                Permission::all(),
                CachePolicy::WriteBack,
            )
            .unwrap();
            assert_eq!(mm::owned_frames(owner), ept.mapped_pages());
        }
        for i in 0..8 {
            drop(ept.unmap(Gpa::new(i * 0x1000).unwrap()).unwrap());
            assert_eq!(mm::owned_frames(owner), ept.mapped_pages());
        }
        ept.release_frames();
        assert_eq!(mm::owned_frames(owner), 0);
        assert_eq!(ept.mapped_pages(), 0);
    }

    #[test]
    fn empty_nodes_reclaimed_eagerly() {
        init_mm();
        let mut ept = ExtendedPageTable::new(0xA5);
        let gpa = Gpa::new(0x8000_0000).unwrap();
        ept.map(
            gpa,
            Page::new().unwrap(),
            Permission::READ,
            CachePolicy::WriteBack,
        )
        .unwrap();
        assert_eq!(ept.nodes.len(), 3);
        drop(ept.unmap(gpa).unwrap());
        assert_eq!(ept.nodes.len(), 0);
        ept.release_frames();
    }

    #[test]
    fn teardown_is_idempotent_on_empty_tree() {
        init_mm();
        let owner = 0xA6;
        let mut ept = ExtendedPageTable::new(owner);
        ept.map(
            Gpa::new(0).unwrap(),
            Page::new().unwrap(),
            Permission::READ,
            CachePolicy::WriteBack,
        )
        .unwrap();
        ept.release_frames();
        assert_eq!(ept.mapped_pages(), 0);
        assert_eq!(mm::owned_frames(owner), 0);
        // A second pass over the already-empty tree changes nothing.
        ept.release_frames();
        assert_eq!(mm::owned_frames(owner), 0);
        assert_eq!(ept.nodes.len(), 0);
    }

    #[test]
    fn pass_through_frames_survive_teardown() {
        init_mm();
        let owner = 0xA7;
        let mut ept = ExtendedPageTable::new(owner);
        let device = Page::new().unwrap();
        unsafe {
            ept.map_page(
                Gpa::new(0xFEE0_0000).unwrap(),
                device.pa(),
                Permission::READ | Permission::WRITE,
                CachePolicy::Uncached,
            )
            .unwrap();
        }
        let (pa, _, policy) = ept.walk_flags(Gpa::new(0xFEE0_0000).unwrap()).unwrap();
        assert_eq!(pa, device.pa());
        assert_eq!(policy, CachePolicy::Uncached);

        assert_eq!(
            ept.unmap(Gpa::new(0xFEE0_0000).unwrap()).map(|_| ()),
            Err(EptMappingError::Foreign)
        );
        ept.release_frames();
        // The device page is still ours to free.
        assert_eq!(mm::owner_of(device.pa()), Some(mm::OWNER_HYPERVISOR));
    }
}
