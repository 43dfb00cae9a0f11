//! ACPI table relocation.
//!
//! The firmware leaves the RSDP and the system-description tables wherever
//! it likes; the guest gets a private copy placed immediately above its
//! RAM, with every embedded physical pointer rewritten to the new
//! guest-physical locations and the checksums fixed up. Relocation is a
//! one-shot, non-idempotent step of bring-up, guarded by the explicit
//! [`crate::BootPhase`] value the boot path owns.

use crate::BootPhase;

/// Tables as discovered by the firmware collaborator: the RSDP structure
/// and the contiguous physical extent holding the RSDT and everything it
/// points at.
pub struct FirmwareTables<'a> {
    /// The 20- or 36-byte RSDP.
    pub rsdp: &'a [u8],
    /// Physical base address of `blob`.
    pub extent_base: usize,
    /// The tables themselves, starting somewhere inside the extent.
    pub blob: &'a [u8],
    /// Offset of the RSDT inside `blob`.
    pub rsdt_offset: usize,
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn fix_checksum(bytes: &mut [u8], at: usize) {
    bytes[at] = 0;
    bytes[at] = 0u8.wrapping_sub(checksum(bytes));
}

/// Rewrite a relocated RSDP so it points at the RSDT's new location.
///
/// `rsdp` must already be a copy; the firmware original is left alone.
pub fn rewrite_rsdp(rsdp: &mut [u8], new_rsdt: u64) {
    assert!(rsdp.len() >= 20 && &rsdp[0..8] == b"RSD PTR ", "not an RSDP");
    rsdp[16..20].copy_from_slice(&(new_rsdt as u32).to_le_bytes());
    fix_checksum(&mut rsdp[..20], 8);
    // An ACPI 2.0 descriptor also carries the 64-bit XSDT pointer and its
    // own extended checksum.
    if rsdp.len() >= 36 && rsdp[15] >= 2 {
        rsdp[24..32].copy_from_slice(&new_rsdt.to_le_bytes());
        fix_checksum(&mut rsdp[..36], 32);
    }
}

/// Shift every table pointer inside a relocated RSDT by `delta` and fix
/// its checksum.
pub fn rewrite_rsdt(rsdt: &mut [u8], delta: i64) {
    assert!(rsdt.len() >= 36 && &rsdt[0..4] == b"RSDT", "not an RSDT");
    let len = u32::from_le_bytes(rsdt[4..8].try_into().unwrap()) as usize;
    assert!(len <= rsdt.len(), "RSDT length exceeds its extent");
    let mut at = 36;
    while at + 4 <= len {
        let old = u32::from_le_bytes(rsdt[at..at + 4].try_into().unwrap());
        let new = (old as i64 + delta) as u32;
        rsdt[at..at + 4].copy_from_slice(&new.to_le_bytes());
        at += 4;
    }
    fix_checksum(&mut rsdt[..len], 9);
}

/// Relocate `tables` into buffers destined for guest-physical `dst_gpa`:
/// the blob lands at `dst_gpa`, the rewritten RSDP is returned for the
/// caller to place. Advances the boot phase; calling twice is a bug, not a
/// silently ignored repeat.
pub fn relocate(
    phase: &mut BootPhase,
    tables: &FirmwareTables<'_>,
    dst_gpa: usize,
    blob_out: &mut [u8],
) -> [u8; 36] {
    assert_eq!(
        *phase,
        BootPhase::Early,
        "ACPI tables relocated twice"
    );
    *phase = BootPhase::AcpiRelocated;

    assert!(blob_out.len() >= tables.blob.len());
    blob_out[..tables.blob.len()].copy_from_slice(tables.blob);

    let delta = dst_gpa as i64 - tables.extent_base as i64;
    let rsdt_gpa = (dst_gpa + tables.rsdt_offset) as u64;
    rewrite_rsdt(&mut blob_out[tables.rsdt_offset..tables.blob.len()], delta);

    let mut rsdp = [0u8; 36];
    rsdp[..tables.rsdp.len()].copy_from_slice(tables.rsdp);
    rewrite_rsdp(&mut rsdp[..tables.rsdp.len().max(20)], rsdt_gpa);
    rsdp
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_tables(extent_base: usize) -> (Vec<u8>, Vec<u8>) {
        // RSDT with two entries pointing at tables inside the extent.
        let len = 36 + 8;
        let mut rsdt = vec![0u8; len];
        rsdt[0..4].copy_from_slice(b"RSDT");
        rsdt[4..8].copy_from_slice(&(len as u32).to_le_bytes());
        rsdt[36..40].copy_from_slice(&((extent_base + 0x100) as u32).to_le_bytes());
        rsdt[40..44].copy_from_slice(&((extent_base + 0x200) as u32).to_le_bytes());
        fix_checksum(&mut rsdt, 9);

        let mut rsdp = vec![0u8; 20];
        rsdp[0..8].copy_from_slice(b"RSD PTR ");
        rsdp[16..20].copy_from_slice(&(extent_base as u32).to_le_bytes());
        fix_checksum(&mut rsdp, 8);
        (rsdp, rsdt)
    }

    #[test]
    fn relocation_rewrites_pointers_and_checksums() {
        let extent_base = 0x000E_0000;
        let (rsdp, rsdt) = sample_tables(extent_base);
        let tables = FirmwareTables {
            rsdp: &rsdp,
            extent_base,
            blob: &rsdt,
            rsdt_offset: 0,
        };

        let dst = 0x0400_0000;
        let mut out = vec![0u8; rsdt.len()];
        let mut phase = BootPhase::Early;
        let new_rsdp = relocate(&mut phase, &tables, dst, &mut out);
        assert_eq!(phase, BootPhase::AcpiRelocated);

        // RSDP points at the relocated RSDT and still sums to zero.
        assert_eq!(
            u32::from_le_bytes(new_rsdp[16..20].try_into().unwrap()),
            dst as u32
        );
        assert_eq!(checksum(&new_rsdp[..20]), 0);

        // RSDT entries moved by the delta and the table sums to zero.
        assert_eq!(
            u32::from_le_bytes(out[36..40].try_into().unwrap()),
            (dst + 0x100) as u32
        );
        assert_eq!(
            u32::from_le_bytes(out[40..44].try_into().unwrap()),
            (dst + 0x200) as u32
        );
        assert_eq!(checksum(&out), 0);
    }

    #[test]
    #[should_panic(expected = "relocated twice")]
    fn relocation_is_one_shot() {
        let (rsdp, rsdt) = sample_tables(0xE_0000);
        let tables = FirmwareTables {
            rsdp: &rsdp,
            extent_base: 0xE_0000,
            blob: &rsdt,
            rsdt_offset: 0,
        };
        let mut out = vec![0u8; rsdt.len()];
        let mut phase = BootPhase::Early;
        relocate(&mut phase, &tables, 0x100_0000, &mut out);
        relocate(&mut phase, &tables, 0x100_0000, &mut out);
    }
}
