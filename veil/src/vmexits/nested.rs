//! Nested-virtualization vmexit controller.
//!
//! An L1 guest that believes it owns the hardware issues VMXON, VMCLEAR,
//! VMPTRLD, VMWRITE and VMLAUNCH; each traps here and is re-homed onto a
//! shadow VMCS that L0 actually owns. The guest-supplied guest-physical
//! addresses of the VMX regions resolve through the EPT manager, the
//! L1-written fields accumulate in the shadow record, and VMLAUNCH
//! rewrites the shadow's EPT-pointer field so the nested guest's memory
//! still translates through L0's EPT chain (L2 guest-physical through
//! L1's tables, then L1 guest-physical through the outer tables).
//!
//! After every successfully emulated step the guest's carry and zero
//! flags are cleared: the real instruction never executed, so the
//! success indication is ours to fabricate.

use crate::ept::ExtendedPageTable;
use crate::snapshot::VmcsSnapshot;
use crate::vcpu::VmexitResult;
use crate::vm::Gpa;
use crate::vmcs::{ActiveVmcs, BasicExitReason, Field, TrapEvent};
use crate::vmexits::{VmexitController, VprocContext};
use crate::VmError;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use bedrock::addressing::Pa;
use bedrock::cpu::GeneralPurposeRegisters;
use bedrock::mm::Page;

/// Encoding of the EPT-pointer field inside the shadow field store.
const EPTP_ENCODING: u32 = 0x0000_201A;
/// Address bits of an EPT pointer or entry.
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// The L0-owned record standing in for the L1 guest's VMX state.
pub struct ShadowVmcs {
    /// L1's VMXON region: guest-physical and resolved host-physical.
    pub vmxon: (Gpa, Pa),
    /// The L2 VMCS the L1 guest currently points at.
    pub current: Option<(Gpa, Pa)>,
    /// The region hardware is actually pointed at for nested entries.
    region: Page,
    /// Every field the L1 guest has written, by raw encoding.
    pub fields: BTreeMap<u32, u64>,
    /// Launch state of the shadow region, for VMLAUNCH/VMRESUME parity.
    launched: u64,
    pending_entry: bool,
    engaged: bool,
    /// L1 context parked while the nested guest runs.
    saved_l1: Option<Box<(VmcsSnapshot, GeneralPurposeRegisters)>>,
}

impl ShadowVmcs {
    fn new(vmxon_gpa: Gpa, vmxon_hpa: Pa) -> Self {
        Self {
            vmxon: (vmxon_gpa, vmxon_hpa),
            current: None,
            region: Page::new().expect("out of frames for shadow VMCS"),
            fields: BTreeMap::new(),
            launched: 0,
            pending_entry: false,
            engaged: false,
            saved_l1: None,
        }
    }

    /// Host-physical address of the shadow region; registered so the
    /// dispatcher can resolve the vproc while the shadow is loaded.
    pub fn region_pa(&self) -> Pa {
        self.region.pa()
    }

    /// Whether an emulated VMLAUNCH is waiting to enter the nested guest.
    pub fn take_pending_entry(&mut self) -> bool {
        core::mem::replace(&mut self.pending_entry, false)
    }

    /// Whether the shadow region is the vproc's running context.
    pub fn engaged(&self) -> bool {
        self.engaged
    }

    /// Launch-state word for the VM-entry stub.
    pub fn launched_mut(&mut self) -> &mut u64 {
        &mut self.launched
    }

    /// Park the L1 context and mark the shadow engaged.
    pub fn engage(&mut self, snapshot: &VmcsSnapshot, gprs: &GeneralPurposeRegisters) {
        self.saved_l1 = Some(Box::new((*snapshot, *gprs)));
        self.engaged = true;
    }

    /// Seed a snapshot mirror from the L1-written fields so the run loop
    /// observes the nested guest's state.
    pub fn seed_mirror(&self, snapshot: &mut VmcsSnapshot) {
        for (encoding, value) in &self.fields {
            if let Some(field) = Field::from_encoding(*encoding) {
                snapshot.store(field, *value);
            }
        }
    }

    /// Load the shadow region and flush the L1-written fields plus L0's
    /// host state into it.
    ///
    /// The host-state override is not optional: the nested guest's exits
    /// must land in L0's exit stub regardless of what L1 wrote.
    ///
    /// # Safety
    /// VMX root operation, hardware path only.
    pub unsafe fn enter(&mut self, l0: &VmcsSnapshot) -> Result<ActiveVmcs, VmError> {
        // Stamp the revision identifier into the region head.
        let rev =
            bedrock::msr::Msr::<{ crate::vm_control::IA32_VMX_BASIC }>::read() as u32 & 0x7fff_ffff;
        let bytes = core::slice::from_raw_parts_mut(
            self.region.va().into_usize() as *mut u8,
            4,
        );
        bytes.copy_from_slice(&rev.to_le_bytes());

        let active = ActiveVmcs::activate_pa(self.region.pa())?;
        for (encoding, value) in &self.fields {
            active.write_raw(*encoding, *value)?;
        }
        l0.commit_host(&active)?;
        Ok(active)
    }
}

/// Nested-virtualization vmexit controller.
///
/// Operand convention: the guest-physical address of the region under
/// operation arrives in `rdi` (for VMXON/VMCLEAR/VMPTRLD), the field
/// encoding in `rdi` and the value in `rsi` (for VMWRITE).
pub struct Controller {}

impl Controller {
    /// Create a new nested-VMX controller.
    pub fn new() -> Self {
        Self {}
    }

    fn shadow<'a>(ctx: &'a mut VprocContext<'_>) -> Result<&'a mut ShadowVmcs, VmError> {
        ctx.shadow
            .as_mut()
            .ok_or(VmError::ControllerError(Box::new("VMX instruction before VMXON")))
    }
}

impl VmexitController for Controller {
    fn handle(
        &mut self,
        event: &TrapEvent,
        ctx: &mut VprocContext<'_>,
    ) -> Result<VmexitResult, VmError> {
        match event.basic_reason() {
            BasicExitReason::Vmxon => {
                let gpa = Gpa::new(ctx.gprs.rdi).ok_or(VmError::FailedToDecodeInstruction)?;
                let hpa = ctx.translate(gpa)?;
                *ctx.shadow = Some(ShadowVmcs::new(gpa, hpa));
            }
            BasicExitReason::Vmclear => {
                let gpa = Gpa::new(ctx.gprs.rdi).ok_or(VmError::FailedToDecodeInstruction)?;
                let hpa = ctx.translate(gpa)?;
                let shadow = Self::shadow(ctx)?;
                if shadow.current.map(|(_, cur)| cur) == Some(hpa) {
                    shadow.launched = 0;
                }
            }
            BasicExitReason::Vmptrld => {
                let gpa = Gpa::new(ctx.gprs.rdi).ok_or(VmError::FailedToDecodeInstruction)?;
                let hpa = ctx.translate(gpa)?;
                Self::shadow(ctx)?.current = Some((gpa, hpa));
            }
            BasicExitReason::Vmwrite => {
                let (encoding, value) = (ctx.gprs.rdi as u32, ctx.gprs.rsi as u64);
                Self::shadow(ctx)?.fields.insert(encoding, value);
            }
            BasicExitReason::Vmlaunch | BasicExitReason::Vmresume => {
                // Rewrite the EPT pointer: the root L1 supplied is an L1
                // guest-physical address; hardware needs the host-physical
                // one, and the nested guest's accesses then compose L1's
                // tables with ours.
                let eptp = {
                    let shadow = Self::shadow(ctx)?;
                    shadow.fields.get(&EPTP_ENCODING).copied()
                };
                if let Some(eptp) = eptp {
                    let root = Gpa::new((eptp & ADDR_MASK) as usize)
                        .ok_or(VmError::FailedToDecodeInstruction)?;
                    let root_hpa = ctx.translate(root)?;
                    let rewritten =
                        (unsafe { root_hpa.into_usize() } as u64 & ADDR_MASK) | (eptp & !ADDR_MASK);
                    Self::shadow(ctx)?.fields.insert(EPTP_ENCODING, rewritten);
                }
                let shadow = Self::shadow(ctx)?;
                if shadow.current.is_none() {
                    return Err(VmError::ControllerError(Box::new("VMLAUNCH without a current VMCS")));
                }
                shadow.pending_entry = true;
            }
            _ => return Err(VmError::HandleVmexitFailed(event.reason)),
        }
        ctx.snapshot.flag_vmx_success();
        ctx.snapshot.advance_rip(event.instruction_length);
        Ok(VmexitResult::Ok)
    }
}

/// Resolve a nested guest-physical address: walk the L1 guest's EPT
/// (whose nodes and entries live in L1 guest-physical space) with every
/// step translated through the outer EPT.
pub fn translate_nested(
    outer: &ExtendedPageTable,
    l1_eptp: u64,
    gpa2: Gpa,
) -> Option<Pa> {
    let addr = unsafe { gpa2.into_usize() } as u64;
    let mut table_l1gpa = l1_eptp & ADDR_MASK;
    for level in (1..=3).rev() {
        let entry = read_l1_entry(outer, table_l1gpa, (addr >> (12 + 9 * level)) & 0x1ff)?;
        if entry & 0x7 == 0 {
            return None;
        }
        table_l1gpa = entry & ADDR_MASK;
    }
    let entry = read_l1_entry(outer, table_l1gpa, (addr >> 12) & 0x1ff)?;
    if entry & 0x7 == 0 {
        return None;
    }
    let l1gpa = (entry & ADDR_MASK) | (addr & 0xfff);
    outer.walk(Gpa::new(l1gpa as usize)?)
}

fn read_l1_entry(outer: &ExtendedPageTable, table_l1gpa: u64, index: u64) -> Option<u64> {
    let hpa = outer.walk(Gpa::new(table_l1gpa as usize)?)?;
    Some(unsafe {
        core::ptr::read((hpa.into_va().into_usize() as *const u64).add(index as usize))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ept::{CachePolicy, Permission};
    use crate::test_support::init_mm;
    use crate::vcpu::SipiTracker;
    use crate::vmexits::SmpJoin;
    use alloc::sync::Arc;
    use bedrock::cpu::Rflags;
    use spin::Mutex as SpinLock;

    struct NoJoin;
    impl SmpJoin for NoJoin {
        fn join_core(&self, _: u32, _: u8, _: u8) -> Result<(), VmError> {
            unreachable!()
        }
    }

    fn mapped_tree(owner: u32, gpas: &[usize]) -> Arc<SpinLock<ExtendedPageTable>> {
        init_mm();
        let ept = ExtendedPageTable::new(owner);
        let ept = Arc::new(SpinLock::new(ept));
        {
            let mut guard = ept.lock();
            for gpa in gpas {
                guard
                    .map(
                        Gpa::new(*gpa).unwrap(),
                        Page::new().unwrap(),
                        Permission::all(),
                        CachePolicy::WriteBack,
                    )
                    .unwrap();
            }
        }
        ept
    }

    fn run_op(
        ept: &Arc<SpinLock<ExtendedPageTable>>,
        shadow: &mut Option<ShadowVmcs>,
        reason: BasicExitReason,
        rdi: usize,
        rsi: usize,
        snapshot: &mut crate::snapshot::VmcsSnapshot,
    ) -> Result<VmexitResult, VmError> {
        let mut gprs = GeneralPurposeRegisters::default();
        gprs.rdi = rdi;
        gprs.rsi = rsi;
        let mut sipi = SipiTracker::default();
        let mut ctx = VprocContext {
            id: 9,
            snapshot,
            gprs: &mut gprs,
            ept,
            shadow,
            sipi: &mut sipi,
            smp: &NoJoin,
        };
        Controller::new().handle(&TrapEvent::synthetic(reason, 0, 3), &mut ctx)
    }

    #[test]
    fn vmxon_populates_shadow_and_reports_success() {
        let vmxon_gpa = 0x3000;
        let ept = mapped_tree(0xF1, &[vmxon_gpa]);
        let expected_hpa = ept.lock().walk(Gpa::new(vmxon_gpa).unwrap()).unwrap();

        let mut snapshot = crate::snapshot::VmcsSnapshot::default();
        snapshot.guest.rflags = (Rflags::_1 | Rflags::CF | Rflags::ZF).bits();
        snapshot.guest.rip = 0x500;
        let mut shadow = None;
        run_op(
            &ept,
            &mut shadow,
            BasicExitReason::Vmxon,
            vmxon_gpa,
            0,
            &mut snapshot,
        )
        .unwrap();

        let sh = shadow.as_ref().expect("shadow record not created");
        assert_eq!(sh.vmxon, (Gpa::new(vmxon_gpa).unwrap(), expected_hpa));
        assert!(sh.current.is_none());
        // Success flags and forward progress; the real VMXON never ran.
        assert_eq!(
            snapshot.guest.rflags & (Rflags::CF | Rflags::ZF).bits(),
            0
        );
        assert_eq!(snapshot.guest.rip, 0x503);

        ept.lock().release_frames();
    }

    #[test]
    fn vmptrld_vmwrite_vmclear_drive_the_shadow() {
        let (vmxon_gpa, vmcs_gpa) = (0x3000, 0x5000);
        let ept = mapped_tree(0xF2, &[vmxon_gpa, vmcs_gpa]);
        let mut snapshot = crate::snapshot::VmcsSnapshot::default();
        let mut shadow = None;

        run_op(&ept, &mut shadow, BasicExitReason::Vmxon, vmxon_gpa, 0, &mut snapshot).unwrap();
        run_op(&ept, &mut shadow, BasicExitReason::Vmptrld, vmcs_gpa, 0, &mut snapshot).unwrap();
        let cur_hpa = ept.lock().walk(Gpa::new(vmcs_gpa).unwrap()).unwrap();
        assert_eq!(
            shadow.as_ref().unwrap().current,
            Some((Gpa::new(vmcs_gpa).unwrap(), cur_hpa))
        );

        // An L1 VMWRITE lands in the shadow field store, not hardware.
        run_op(
            &ept,
            &mut shadow,
            BasicExitReason::Vmwrite,
            0x681E,
            0xcafe,
            &mut snapshot,
        )
        .unwrap();
        assert_eq!(shadow.as_ref().unwrap().fields.get(&0x681E), Some(&0xcafe));

        shadow.as_mut().unwrap().launched = 1;
        run_op(&ept, &mut shadow, BasicExitReason::Vmclear, vmcs_gpa, 0, &mut snapshot).unwrap();
        assert_eq!(shadow.as_ref().unwrap().launched, 0);

        ept.lock().release_frames();
    }

    #[test]
    fn vmlaunch_rewrites_eptp_through_outer_ept() {
        let (vmxon_gpa, vmcs_gpa, l1_root_gpa) = (0x3000, 0x5000, 0x7000);
        let ept = mapped_tree(0xF3, &[vmxon_gpa, vmcs_gpa, l1_root_gpa]);
        let root_hpa = ept.lock().walk(Gpa::new(l1_root_gpa).unwrap()).unwrap();
        let mut snapshot = crate::snapshot::VmcsSnapshot::default();
        let mut shadow = None;

        run_op(&ept, &mut shadow, BasicExitReason::Vmxon, vmxon_gpa, 0, &mut snapshot).unwrap();
        run_op(&ept, &mut shadow, BasicExitReason::Vmptrld, vmcs_gpa, 0, &mut snapshot).unwrap();
        run_op(
            &ept,
            &mut shadow,
            BasicExitReason::Vmwrite,
            EPTP_ENCODING as usize,
            l1_root_gpa | (3 << 3) | 6,
            &mut snapshot,
        )
        .unwrap();
        run_op(&ept, &mut shadow, BasicExitReason::Vmlaunch, 0, 0, &mut snapshot).unwrap();

        let sh = shadow.as_mut().unwrap();
        let eptp = *sh.fields.get(&EPTP_ENCODING).unwrap();
        assert_eq!(
            eptp & ADDR_MASK,
            unsafe { root_hpa.into_usize() } as u64 & ADDR_MASK
        );
        assert_eq!(eptp & !ADDR_MASK, (3 << 3) | 6);
        assert!(sh.take_pending_entry());
        assert!(!sh.take_pending_entry());

        ept.lock().release_frames();
    }

    #[test]
    fn nested_translation_composes_both_levels() {
        // Outer EPT: identity-style tree over a handful of test frames.
        // L1's EPT lives *inside* guest memory: its nodes are guest frames
        // whose entries carry L1 guest-physical addresses.
        let gpas = [
            0x1_0000, // L1 EPT pml4
            0x1_1000, // L1 EPT pdpt
            0x1_2000, // L1 EPT pd
            0x1_3000, // L1 EPT pt
            0x2_0000, // L2 data page, in L1 guest-physical terms
        ];
        let ept = mapped_tree(0xF4, &gpas);

        // Build L1's four-level chain mapping L2 gpa 0x40_0000 to L1 gpa
        // 0x2_0000 with full permission.
        let l2_gpa = 0x40_0000u64;
        {
            let guard = ept.lock();
            let entry = |target: u64| (target | 0x7).to_le_bytes();
            let idx = |shift: u32| ((l2_gpa >> shift) & 0x1ff) as usize * 8;
            guard.write_bytes(0x1_0000 + idx(39), &entry(0x1_1000)).unwrap();
            guard.write_bytes(0x1_1000 + idx(30), &entry(0x1_2000)).unwrap();
            guard.write_bytes(0x1_2000 + idx(21), &entry(0x1_3000)).unwrap();
            guard.write_bytes(0x1_3000 + idx(12), &entry(0x2_0000)).unwrap();
        }

        let guard = ept.lock();
        let via_nested = translate_nested(
            &guard,
            0x1_0000 | (3 << 3) | 6,
            Gpa::new(l2_gpa as usize + 0x123).unwrap(),
        )
        .expect("nested walk failed");

        // The flattened equivalent: compose the two mappings by hand.
        let direct = guard.walk(Gpa::new(0x2_0000 + 0x123).unwrap()).unwrap();
        assert_eq!(via_nested, direct);

        // An L2 address L1 never mapped stays unmapped.
        assert_eq!(
            translate_nested(&guard, 0x1_0000 | (3 << 3) | 6, Gpa::new(0x80_0000).unwrap()),
            None
        );
        drop(guard);
        ept.lock().release_frames();
    }
}
