//! Guest physical address space construction.
//!
//! `GuestSpace` builds everything a guest observes in physical memory
//! before its first instruction: RAM backed by fresh zeroed frames, the
//! bootstrap descriptor table and disklabel block, the kernel image copied
//! out of its ELF segments, initial page tables with a recursive self-map
//! entry, the RAM-disk image and the relocated ACPI tables immediately
//! above RAM, and the fixed-format guest memory map.

use crate::acpi::{self, FirmwareTables};
use crate::elf::{Elf64, PType};
use crate::ept::{CachePolicy, EptMappingError, ExtendedPageTable, Permission, GUEST_SPACE_LIMIT};
use crate::probe::Probe;
use crate::vm::Gpa;
use crate::{BootPhase, VmError};
use alloc::boxed::Box;
use bedrock::addressing::{PAGE_MASK, PAGE_SIZE};
use bedrock::mm::Page;
use num_enum::IntoPrimitive;

/// Guest-physical home of the bootstrap descriptor table.
pub const GDT_BASE: usize = 0x2000;
/// Guest-physical home of the disklabel block (first image sector).
pub const DISKLABEL_BASE: usize = 0x3000;
/// Guest-physical root of the initial page tables.
pub const BOOT_PT_BASE: usize = 0x4000;
/// Guest-physical home of the relocated RSDP.
pub const RSDP_GPA: usize = 0xD000;
/// Guest-physical address of the memory-map entry count.
pub const GUEST_MEMMAP_COUNT: usize = 0xDFF8;
/// Guest-physical base of the memory-map records.
pub const GUEST_MEMMAP_BASE: usize = 0xE000;
/// Recursive self-map slot of the initial page tables.
pub const RECURSIVE_PML4_SLOT: usize = 510;

/// Bytes in one disk sector; the disklabel occupies the first sector of an
/// image and the kernel ELF starts at the next sector boundary.
pub const SECTOR_SIZE: usize = 512;

/// Region kinds of the guest memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u32)]
pub enum RegionKind {
    /// Normal RAM.
    Ram = 1,
    /// Reserved; the guest must not touch it.
    Reserved = 2,
    /// RAM-disk image.
    Ramdisk = 3,
    /// Relocated ACPI tables.
    AcpiRelocated = 4,
}

/// One published memory-map record: base, length, kind, pad.
const MEMMAP_RECORD_SIZE: usize = 24;

struct MemmapWriter {
    buf: alloc::vec::Vec<u8>,
    count: u32,
}

impl MemmapWriter {
    fn new() -> Self {
        Self {
            buf: alloc::vec::Vec::new(),
            count: 0,
        }
    }

    fn record(&mut self, base: u64, length: u64, kind: RegionKind) -> &mut Self {
        if length == 0 {
            return self;
        }
        self.buf.extend_from_slice(&base.to_le_bytes());
        self.buf.extend_from_slice(&length.to_le_bytes());
        self.buf.extend_from_slice(&u32::from(kind).to_le_bytes());
        self.buf.extend_from_slice(&0u32.to_le_bytes());
        self.count += 1;
        debug_assert_eq!(self.buf.len(), self.count as usize * MEMMAP_RECORD_SIZE);
        self
    }
}

/// The built guest physical address space of one vproc.
pub struct GuestSpace {
    ept: ExtendedPageTable,
    /// Physical entry point of the loaded kernel.
    entry: usize,
    /// Bytes of plain guest RAM.
    ram_bytes: usize,
    /// First free guest-physical address above everything mapped.
    top: usize,
}

impl GuestSpace {
    /// Build the address space: `ram_bytes` of RAM, the kernel loaded from
    /// `image` (disklabel sector followed by its ELF), `ramdisk` and the
    /// relocated `firmware` tables appended above RAM, and the memory map
    /// published at its fixed location.
    ///
    /// Panics when the requested span needs more than one level-4 entry;
    /// that is the design's hard capacity limit, not an error path.
    pub fn build(
        owner: u32,
        image: &[u8],
        ram_bytes: usize,
        ramdisk: &[u8],
        firmware: Option<&FirmwareTables<'_>>,
        phase: &mut BootPhase,
    ) -> Result<Self, VmError> {
        assert_eq!(ram_bytes & PAGE_MASK, 0, "guest RAM size must be page aligned");
        let ramdisk_pages = (ramdisk.len() + PAGE_MASK) >> 12;
        let acpi_pages = firmware.map(|fw| (fw.blob.len() + PAGE_MASK) >> 12).unwrap_or(0);
        let span = ram_bytes + (ramdisk_pages + acpi_pages) * PAGE_SIZE;
        assert!(
            span <= GUEST_SPACE_LIMIT,
            "guest physical space exceeds one level-4 entry ({:#x} bytes)",
            span
        );

        let mut space = Self {
            ept: ExtendedPageTable::new(owner),
            entry: 0,
            ram_bytes,
            top: ram_bytes,
        };

        // Plain RAM: every page gets a fresh zeroed cacheable frame with
        // full permission; the guest's own loader narrows permissions
        // later, not this layer.
        for gpa in (0..ram_bytes).step_by(PAGE_SIZE) {
            let pg = Page::new().expect("out of frames for guest RAM");
            space
                .ept
                .map(
                    Gpa::new(gpa).unwrap(),
                    pg,
                    Permission::all(),
                    CachePolicy::WriteBack,
                )
                .map_err(|e| VmError::ControllerError(Box::new(e)))?;
        }

        space.install_bootstrap_tables(image)?;
        space.load_kernel(image)?;
        space.build_boot_page_tables()?;

        let ramdisk_base = space.append_region(ramdisk)?;
        let acpi_base = match firmware {
            Some(fw) => Some(space.relocate_acpi(fw, phase)?),
            None => None,
        };

        // Publish the memory map through a temporarily attached page.
        let mut writer = MemmapWriter::new();
        writer
            .record(0, ram_bytes as u64, RegionKind::Ram)
            .record(
                ramdisk_base as u64,
                ramdisk.len() as u64,
                RegionKind::Ramdisk,
            );
        if let Some(base) = acpi_base {
            writer.record(
                base as u64,
                firmware.unwrap().blob.len() as u64,
                RegionKind::AcpiRelocated,
            );
        }
        writer.record(
            bedrock::apic::IOAPIC_BASE as u64,
            (bedrock::apic::APIC_DEFAULT_BASE - bedrock::apic::IOAPIC_BASE + PAGE_SIZE) as u64,
            RegionKind::Reserved,
        );
        assert!(GUEST_MEMMAP_BASE + writer.buf.len() <= GUEST_MEMMAP_BASE + PAGE_SIZE);
        space.write_bytes(GUEST_MEMMAP_BASE, &writer.buf)?;
        space.write_bytes(GUEST_MEMMAP_COUNT, &writer.count.to_le_bytes())?;

        Ok(space)
    }

    /// The translation tree, for handing to the vproc.
    pub fn into_parts(self) -> (ExtendedPageTable, usize, usize) {
        (self.ept, self.entry, BOOT_PT_BASE)
    }

    /// Physical entry point of the loaded kernel.
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Guest CR3 value for the initial page tables.
    pub fn boot_cr3(&self) -> usize {
        BOOT_PT_BASE
    }

    /// Bytes of plain RAM.
    pub fn ram_bytes(&self) -> usize {
        self.ram_bytes
    }

    /// Access the underlying EPT.
    pub fn ept(&self) -> &ExtendedPageTable {
        &self.ept
    }

    /// Access the underlying EPT mutably.
    pub fn ept_mut(&mut self) -> &mut ExtendedPageTable {
        &mut self.ept
    }

    /// Map a device window uncached at `gpa`, pass-through to `hpa`.
    pub fn map_device_page(&mut self, gpa: usize, hpa: usize) -> Result<(), EptMappingError> {
        unsafe {
            self.ept.map_page(
                Gpa::new(gpa).unwrap(),
                bedrock::addressing::Pa::new(hpa).unwrap(),
                Permission::READ | Permission::WRITE,
                CachePolicy::Uncached,
            )
        }
    }

    /// Copy `bytes` into guest-physical memory starting at `gpa`.
    pub fn write_bytes(&self, gpa: usize, bytes: &[u8]) -> Result<(), VmError> {
        self.ept
            .write_bytes(gpa, bytes)
            .map_err(|e| VmError::ControllerError(Box::new(e)))
    }

    /// Read guest-physical memory starting at `gpa`.
    pub fn read_bytes(&self, gpa: usize, out: &mut [u8]) -> Result<(), VmError> {
        self.ept
            .read_bytes(gpa, out)
            .map_err(|e| VmError::ControllerError(Box::new(e)))
    }

    /// Copy the bootstrap descriptor table and the disklabel sector into
    /// low guest memory.
    fn install_bootstrap_tables(&mut self, image: &[u8]) -> Result<(), VmError> {
        // Null, 64-bit code, data.
        let gdt: [u64; 3] = [0, 0x00af_9b00_0000_ffff, 0x00cf_9300_0000_ffff];
        let mut bytes = [0u8; 24];
        for (i, d) in gdt.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&d.to_le_bytes());
        }
        self.write_bytes(GDT_BASE, &bytes)?;

        let label = &image[..SECTOR_SIZE.min(image.len())];
        self.write_bytes(DISKLABEL_BASE, label)
    }

    /// Copy the kernel's loadable segments into guest-physical memory and
    /// record its entry point, located through the boot-sector convention.
    fn load_kernel(&mut self, image: &[u8]) -> Result<(), VmError> {
        let elf_bytes = image
            .get(SECTOR_SIZE..)
            .ok_or_else(|| VmError::ControllerError(Box::new("image too short for a kernel")))?;
        let elf = Elf64::parse(elf_bytes)
            .map_err(|e| VmError::ControllerError(Box::new(e)))?;
        for phdr in elf.phdrs().filter(|p| p.type_ == PType::Load) {
            if let Some(seg) = elf.segment_bytes(&phdr) {
                self.write_bytes(phdr.paddr, seg)?;
            }
        }
        self.entry = elf
            .entry_paddr()
            .ok_or_else(|| VmError::ControllerError(Box::new("entry outside loadable segments")))?;
        Ok(())
    }

    /// Build the guest's initial paging structures inside guest RAM:
    /// identity map of RAM on 2 MiB pages, plus the recursive self-map
    /// entry for guest-side introspection.
    fn build_boot_page_tables(&mut self) -> Result<(), VmError> {
        const P_RW: u64 = 0x3;
        const PS: u64 = 0x80;
        let pml4 = BOOT_PT_BASE;
        let pdpt = BOOT_PT_BASE + PAGE_SIZE;

        self.write_bytes(pml4, &((pdpt as u64) | P_RW).to_le_bytes())?;
        self.write_bytes(
            pml4 + RECURSIVE_PML4_SLOT * 8,
            &((pml4 as u64) | P_RW).to_le_bytes(),
        )?;

        // One page directory per GiB of RAM, 2 MiB mappings throughout.
        let gib = (self.ram_bytes + (1 << 30) - 1) >> 30;
        for g in 0..gib {
            let pd = BOOT_PT_BASE + (2 + g) * PAGE_SIZE;
            self.write_bytes(pdpt + g * 8, &((pd as u64) | P_RW).to_le_bytes())?;
            for e in 0..512 {
                let base = (g << 30) + (e << 21);
                if base >= self.ram_bytes {
                    break;
                }
                self.write_bytes(pd + e * 8, &((base as u64) | P_RW | PS).to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// Map `bytes` into fresh frames immediately above everything mapped
    /// so far; returns the base of the new region.
    fn append_region(&mut self, bytes: &[u8]) -> Result<usize, VmError> {
        let base = self.top;
        let pages = (bytes.len() + PAGE_MASK) >> 12;
        for i in 0..pages {
            let pg = Page::new().expect("out of frames for guest region");
            self.ept
                .map(
                    Gpa::new(base + i * PAGE_SIZE).unwrap(),
                    pg,
                    Permission::READ | Permission::WRITE,
                    CachePolicy::WriteBack,
                )
                .map_err(|e| VmError::ControllerError(Box::new(e)))?;
        }
        self.top += pages * PAGE_SIZE;
        if !bytes.is_empty() {
            self.write_bytes(base, bytes)?;
        }
        Ok(base)
    }

    /// Relocate the firmware ACPI tables above RAM and plant the rewritten
    /// RSDP at its well-known spot.
    fn relocate_acpi(
        &mut self,
        fw: &FirmwareTables<'_>,
        phase: &mut BootPhase,
    ) -> Result<usize, VmError> {
        let base = self.append_region(&alloc::vec![0u8; fw.blob.len()])?;
        let mut blob = alloc::vec![0u8; fw.blob.len()];
        let rsdp = acpi::relocate(phase, fw, base, &mut blob);
        self.write_bytes(base, &blob)?;
        self.write_bytes(RSDP_GPA, &rsdp)?;
        Ok(base)
    }
}

impl Probe for GuestSpace {
    fn gpa2hpa(&self, gpa: Gpa) -> Option<bedrock::addressing::Pa> {
        self.ept.walk(gpa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acpi::tests::sample_tables;
    use crate::elf::tests::sample_image;
    use crate::test_support::init_mm;

    fn boot_image() -> Vec<u8> {
        // Disklabel sector followed by the kernel ELF.
        let mut image = vec![0xAAu8; SECTOR_SIZE];
        image.extend_from_slice(&sample_image(0x10_0000, 0x10_0000, &[0x90; 256]));
        image
    }

    #[test]
    fn sixty_four_mib_walks_and_bounds() {
        init_mm();
        let ram = 64 << 20;
        let mut phase = BootPhase::Early;
        let space = GuestSpace::build(0xB1, &boot_image(), ram, &[], None, &mut phase).unwrap();

        for gpa in (0..ram).step_by(4 << 20) {
            assert!(space.ept().walk(Gpa::new(gpa).unwrap()).is_some());
        }
        assert!(space.ept().walk(Gpa::new(ram - PAGE_SIZE).unwrap()).is_some());
        assert_eq!(space.ept().walk(Gpa::new(ram + PAGE_SIZE).unwrap()), None);
        assert_eq!(space.entry(), 0x10_0000);

        let mut space = space;
        space.ept_mut().release_frames();
    }

    #[test]
    fn memory_map_records_published_at_fixed_location() {
        init_mm();
        let mut phase = BootPhase::Early;
        let ramdisk = vec![0x5Au8; 3 * PAGE_SIZE + 17];
        let (rsdp, rsdt) = sample_tables(0xE_0000);
        let fw = FirmwareTables {
            rsdp: &rsdp,
            extent_base: 0xE_0000,
            blob: &rsdt,
            rsdt_offset: 0,
        };
        let ram = 2 << 20;
        let space =
            GuestSpace::build(0xB2, &boot_image(), ram, &ramdisk, Some(&fw), &mut phase).unwrap();
        assert_eq!(phase, BootPhase::AcpiRelocated);

        let mut count = [0u8; 4];
        space.read_bytes(GUEST_MEMMAP_COUNT, &mut count).unwrap();
        let count = u32::from_le_bytes(count) as usize;
        assert_eq!(count, 4);

        let mut records = vec![0u8; count * MEMMAP_RECORD_SIZE];
        space.read_bytes(GUEST_MEMMAP_BASE, &mut records).unwrap();
        let rec = |i: usize| {
            let at = i * MEMMAP_RECORD_SIZE;
            (
                u64::from_le_bytes(records[at..at + 8].try_into().unwrap()),
                u64::from_le_bytes(records[at + 8..at + 16].try_into().unwrap()),
                u32::from_le_bytes(records[at + 16..at + 20].try_into().unwrap()),
            )
        };
        assert_eq!(rec(0), (0, ram as u64, RegionKind::Ram.into()));
        assert_eq!(
            rec(1),
            (ram as u64, ramdisk.len() as u64, RegionKind::Ramdisk.into())
        );
        let (acpi_base, acpi_len, kind) = rec(2);
        assert_eq!(kind, u32::from(RegionKind::AcpiRelocated));
        assert_eq!(acpi_base as usize, ram + 4 * PAGE_SIZE);
        assert_eq!(acpi_len as usize, rsdt.len());
        assert_eq!(rec(3).2, u32::from(RegionKind::Reserved));

        // The RAM-disk bytes and relocated RSDP are where the map says.
        let mut b = [0u8; 1];
        space.read_bytes(ram + 100, &mut b).unwrap();
        assert_eq!(b[0], 0x5A);
        let mut sig = [0u8; 8];
        space.read_bytes(RSDP_GPA, &mut sig).unwrap();
        assert_eq!(&sig, b"RSD PTR ");

        let mut space = space;
        space.ept_mut().release_frames();
    }

    #[test]
    fn boot_page_tables_have_recursive_slot() {
        init_mm();
        let mut phase = BootPhase::Early;
        let space =
            GuestSpace::build(0xB3, &boot_image(), 2 << 20, &[], None, &mut phase).unwrap();

        let mut e = [0u8; 8];
        space
            .read_bytes(BOOT_PT_BASE + RECURSIVE_PML4_SLOT * 8, &mut e)
            .unwrap();
        assert_eq!(u64::from_le_bytes(e), BOOT_PT_BASE as u64 | 0x3);

        // The identity map covers RAM with 2 MiB pages.
        space.read_bytes(BOOT_PT_BASE, &mut e).unwrap();
        let pdpt = (u64::from_le_bytes(e) & !0xfff) as usize;
        space.read_bytes(pdpt, &mut e).unwrap();
        let pd = (u64::from_le_bytes(e) & !0xfff) as usize;
        space.read_bytes(pd, &mut e).unwrap();
        assert_eq!(u64::from_le_bytes(e), 0x83);

        let mut space = space;
        space.ept_mut().release_frames();
    }

    #[test]
    fn guest_virtual_walk_through_boot_tables() {
        init_mm();
        let mut phase = BootPhase::Early;
        let space =
            GuestSpace::build(0xB4, &boot_image(), 4 << 20, &[], None, &mut phase).unwrap();

        // The boot tables identity-map RAM, so gva == gpa under them.
        let gva = crate::vm::Gva::new(0x10_0040).unwrap();
        let direct = space.ept().walk(Gpa::new(0x10_0040).unwrap()).unwrap();
        let walked = space
            .gva2hpa(space.boot_cr3() as u64, gva)
            .expect("guest walk failed");
        assert_eq!(walked, direct);

        let mut space = space;
        space.ept_mut().release_frames();
    }

    #[test]
    #[should_panic(expected = "level-4")]
    fn oversized_guest_space_is_fatal() {
        init_mm();
        let mut phase = BootPhase::Early;
        let _ = GuestSpace::build(
            0xB5,
            &boot_image(),
            GUEST_SPACE_LIMIT + PAGE_SIZE,
            &[],
            None,
            &mut phase,
        );
    }
}
