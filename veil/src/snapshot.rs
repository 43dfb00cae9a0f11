//! In-memory mirror of the VMCS.
//!
//! The snapshot is the single source of truth for a vproc's control
//! structure: VM-exit handlers mutate it in memory, and it is flushed into
//! the hardware region before every resume. [`VmcsSnapshot::commit`]
//! writes the fields in a fixed order (host state, then guest state, then
//! control fields) and treats any rejected write as fatal, since a
//! partially written VMCS is unsafe to resume.

use crate::vm_control::{
    self, EntryCtl, ExitCtl, PinCtl, ProcCtl, ProcCtl2, IA32_VMX_ENTRY_CTLS, IA32_VMX_EXIT_CTLS,
    IA32_VMX_PINBASED_CTLS, IA32_VMX_PROC_BASED_CTLS, IA32_VMX_PROC_BASED_CTLS2,
};
use crate::vmcs::{ActiveVmcs, Field};
use crate::VmError;
use bedrock::cpu::{self, Cr0, Cr4, Rflags};
use bedrock::intrinsics::read_cr3;
use bedrock::msr::{Msr, IA32_EFER, IA32_PAT};

/// One guest segment register.
#[derive(Debug, Clone, Copy)]
pub struct GuestSegment {
    pub selector: u64,
    pub base: u64,
    pub limit: u64,
    pub access: u64,
}

impl GuestSegment {
    fn flat(selector: u64, access: u64) -> Self {
        Self {
            selector,
            base: 0,
            limit: 0xffff_ffff,
            access,
        }
    }
}

/// Host-state area of the snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cs_selector: u64,
    pub data_selector: u64,
    pub tr_selector: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub tr_base: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub efer: u64,
    pub pat: u64,
    pub rip: u64,
}

impl HostState {
    /// Capture the running core's state, with `rip` as the VM-exit entry.
    pub fn capture(rip: u64) -> Self {
        let gdtr = cpu::sgdt();
        let idtr = cpu::sidt();
        Self {
            cr0: Cr0::current().bits(),
            cr3: read_cr3() as u64,
            cr4: Cr4::current().bits(),
            cs_selector: cpu::read_cs() as u64,
            data_selector: cpu::read_ss() as u64,
            tr_selector: cpu::read_tr() as u64,
            fs_base: 0,
            gs_base: 0,
            tr_base: 0,
            gdtr_base: gdtr.base,
            idtr_base: idtr.base,
            efer: Msr::<IA32_EFER>::read(),
            pat: Msr::<IA32_PAT>::read(),
            rip,
        }
    }
}

/// Guest-state area of the snapshot.
#[derive(Debug, Clone, Copy)]
pub struct GuestState {
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub debugctl: u64,
    pub dr7: u64,
    pub cs: GuestSegment,
    pub ds: GuestSegment,
    pub es: GuestSegment,
    pub fs: GuestSegment,
    pub gs: GuestSegment,
    pub ss: GuestSegment,
    pub tr: GuestSegment,
    pub ldtr: GuestSegment,
    pub gdtr_base: u64,
    pub gdtr_limit: u64,
    pub idtr_base: u64,
    pub idtr_limit: u64,
    pub activity_state: u64,
    pub interruptibility: u64,
    pub link_pointer: u64,
}

impl Default for GuestState {
    fn default() -> Self {
        // A fresh guest starts in IA-32e mode with paging already built by
        // the lifecycle manager; flat 64-bit segments.
        Self {
            rip: 0,
            rsp: 0,
            rflags: Rflags::_1.bits(),
            cr0: (Cr0::PE | Cr0::NE | Cr0::PG).bits(),
            cr3: 0,
            cr4: (Cr4::PAE | Cr4::VMXE).bits(),
            // LME | LMA.
            efer: 0x500,
            debugctl: 0,
            dr7: 0,
            cs: GuestSegment::flat(0x08, 0xa09b),
            ds: GuestSegment::flat(0x10, 0xc093),
            es: GuestSegment::flat(0x10, 0xc093),
            fs: GuestSegment::flat(0x10, 0xc093),
            gs: GuestSegment::flat(0x10, 0xc093),
            ss: GuestSegment::flat(0x10, 0xc093),
            tr: GuestSegment {
                selector: 0,
                base: 0,
                limit: 0x67,
                access: 0x8b,
            },
            ldtr: GuestSegment {
                selector: 0,
                base: 0,
                limit: 0,
                access: 0x10000,
            },
            gdtr_base: 0,
            gdtr_limit: 0xffff,
            idtr_base: 0,
            idtr_limit: 0xffff,
            activity_state: 0,
            interruptibility: 0,
            link_pointer: u64::MAX,
        }
    }
}

/// Control area of the snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ControlState {
    pub vpid: u64,
    pub pin: PinCtl,
    pub proc1: ProcCtl,
    pub proc2: ProcCtl2,
    pub entry: EntryCtl,
    pub exit: ExitCtl,
    pub exception_bitmap: u64,
    pub eptp: u64,
    pub apic_access_addr: u64,
    pub msr_bitmap_addr: u64,
    pub tpr_threshold: u64,
    pub entry_interruption_info: u64,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            vpid: 0,
            pin: vm_control::default_pin_ctls(),
            proc1: vm_control::default_proc_ctls(),
            proc2: vm_control::default_proc_ctls2(),
            entry: vm_control::default_entry_ctls(),
            exit: vm_control::default_exit_ctls(),
            exception_bitmap: 0,
            eptp: 0,
            apic_access_addr: 0,
            msr_bitmap_addr: 0,
            tpr_threshold: 0,
            entry_interruption_info: 0,
        }
    }
}

/// The in-memory VMCS mirror of one vproc.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmcsSnapshot {
    pub host: HostState,
    pub guest: GuestState,
    pub ctrl: ControlState,
}

/// Interruptibility-state bits blocking interrupt delivery (blocking by
/// STI, blocking by MOV SS).
const INTERRUPT_SHADOW: u64 = 0b11;

impl VmcsSnapshot {
    /// Whether the guest can accept an external interrupt right now.
    pub fn interruptible(&self) -> bool {
        self.guest.rflags & Rflags::IF.bits() != 0
            && self.guest.interruptibility & INTERRUPT_SHADOW == 0
    }

    /// Arm an event injection for the next VM entry.
    pub fn inject_interrupt(&mut self, vector: u8) {
        self.ctrl.entry_interruption_info = 0x8000_0000 | vector as u64;
    }

    /// Whether an event injection is armed.
    pub fn injection_armed(&self) -> bool {
        self.ctrl.entry_interruption_info & 0x8000_0000 != 0
    }

    /// Drop an armed injection (hardware consumed it at entry).
    pub fn clear_injection(&mut self) {
        self.ctrl.entry_interruption_info = 0;
    }

    /// Toggle interrupt-window exiting.
    pub fn set_interrupt_window(&mut self, enabled: bool) {
        self.ctrl
            .proc1
            .set(ProcCtl::INTERRUPT_WINDOW_EXITING, enabled);
    }

    /// Whether interrupt-window exiting is enabled.
    pub fn interrupt_window(&self) -> bool {
        self.ctrl.proc1.contains(ProcCtl::INTERRUPT_WINDOW_EXITING)
    }

    /// Advance the guest instruction pointer past the trapping instruction.
    pub fn advance_rip(&mut self, instruction_length: u64) {
        self.guest.rip += instruction_length;
    }

    /// Report VMX instruction success to the guest: the emulated
    /// instruction never ran, so clear the arithmetic flags it would have
    /// cleared.
    pub fn flag_vmx_success(&mut self) {
        self.guest.rflags &= !(Rflags::CF | Rflags::ZF).bits();
    }

    /// Mirror an out-of-band field modification so subsequent local reads
    /// observe it. Returns false for fields the snapshot does not mirror.
    pub fn store(&mut self, field: Field, v: u64) -> bool {
        match field {
            Field::GuestRip => self.guest.rip = v,
            Field::GuestRsp => self.guest.rsp = v,
            Field::GuestRflags => self.guest.rflags = v,
            Field::GuestCr0 => self.guest.cr0 = v,
            Field::GuestCr3 => self.guest.cr3 = v,
            Field::GuestCr4 => self.guest.cr4 = v,
            Field::GuestIa32Efer => self.guest.efer = v,
            Field::GuestDr7 => self.guest.dr7 = v,
            Field::GuestActivityState => self.guest.activity_state = v,
            Field::GuestInterruptibilityState => self.guest.interruptibility = v,
            Field::Eptptr => self.ctrl.eptp = v,
            Field::Vpid => self.ctrl.vpid = v,
            Field::ExceptionBitmap => self.ctrl.exception_bitmap = v,
            Field::TprThreshold => self.ctrl.tpr_threshold = v,
            Field::VmentryInterruptionInfo => self.ctrl.entry_interruption_info = v,
            _ => return false,
        }
        true
    }

    /// Flush the whole snapshot into the working VMCS.
    ///
    /// Control words are adjusted against the VMX capability MSRs on the
    /// way out (reserved bits forced to their required values). Panics on
    /// the first write the processor rejects.
    pub fn commit(&self, vmcs: &ActiveVmcs) -> Result<(), VmError> {
        self.commit_host(vmcs)?;
        self.commit_guest(vmcs)?;
        self.commit_control(vmcs)
    }

    pub(crate) fn commit_host(&self, vmcs: &ActiveVmcs) -> Result<(), VmError> {
        let h = &self.host;
        vmcs.write(Field::HostCr0, h.cr0)?;
        vmcs.write(Field::HostCr3, h.cr3)?;
        vmcs.write(Field::HostCr4, h.cr4)?;
        vmcs.write(Field::HostCsSelector, h.cs_selector)?;
        vmcs.write(Field::HostEsSelector, h.data_selector)?;
        vmcs.write(Field::HostSsSelector, h.data_selector)?;
        vmcs.write(Field::HostDsSelector, h.data_selector)?;
        vmcs.write(Field::HostFsSelector, h.data_selector)?;
        vmcs.write(Field::HostGsSelector, h.data_selector)?;
        vmcs.write(Field::HostTrSelector, h.tr_selector)?;
        vmcs.write(Field::HostFsBase, h.fs_base)?;
        vmcs.write(Field::HostGsBase, h.gs_base)?;
        vmcs.write(Field::HostTrBase, h.tr_base)?;
        vmcs.write(Field::HostGdtrBase, h.gdtr_base)?;
        vmcs.write(Field::HostIdtrBase, h.idtr_base)?;
        vmcs.write(Field::HostIa32Efer, h.efer)?;
        vmcs.write(Field::HostIa32Pat, h.pat)?;
        vmcs.write(Field::HostRip, h.rip)
    }

    fn commit_guest(&self, vmcs: &ActiveVmcs) -> Result<(), VmError> {
        let g = &self.guest;
        for (seg, sel, base, limit, access) in [
            (
                &g.cs,
                Field::GuestCsSelector,
                Field::GuestCsBase,
                Field::GuestCsLimit,
                Field::GuestCsAccessRights,
            ),
            (
                &g.ds,
                Field::GuestDsSelector,
                Field::GuestDsBase,
                Field::GuestDsLimit,
                Field::GuestDsAccessRights,
            ),
            (
                &g.es,
                Field::GuestEsSelector,
                Field::GuestEsBase,
                Field::GuestEsLimit,
                Field::GuestEsAccessRights,
            ),
            (
                &g.fs,
                Field::GuestFsSelector,
                Field::GuestFsBase,
                Field::GuestFsLimit,
                Field::GuestFsAccessRights,
            ),
            (
                &g.gs,
                Field::GuestGsSelector,
                Field::GuestGsBase,
                Field::GuestGsLimit,
                Field::GuestGsAccessRights,
            ),
            (
                &g.ss,
                Field::GuestSsSelector,
                Field::GuestSsBase,
                Field::GuestSsLimit,
                Field::GuestSsAccessRights,
            ),
            (
                &g.tr,
                Field::GuestTrSelector,
                Field::GuestTrBase,
                Field::GuestTrLimit,
                Field::GuestTrAccessRights,
            ),
            (
                &g.ldtr,
                Field::GuestLdtrSelector,
                Field::GuestLdtrBase,
                Field::GuestLdtrLimit,
                Field::GuestLdtrAccessRights,
            ),
        ] {
            vmcs.write(sel, seg.selector)?;
            vmcs.write(base, seg.base)?;
            vmcs.write(limit, seg.limit)?;
            vmcs.write(access, seg.access)?;
        }
        vmcs.write(Field::GuestGdtrBase, g.gdtr_base)?;
        vmcs.write(Field::GuestGdtrLimit, g.gdtr_limit)?;
        vmcs.write(Field::GuestIdtrBase, g.idtr_base)?;
        vmcs.write(Field::GuestIdtrLimit, g.idtr_limit)?;
        vmcs.write(Field::GuestCr0, g.cr0)?;
        vmcs.write(Field::GuestCr3, g.cr3)?;
        vmcs.write(Field::GuestCr4, g.cr4)?;
        vmcs.write(Field::GuestIa32Efer, g.efer)?;
        vmcs.write(Field::GuestIa32Debugctl, g.debugctl)?;
        vmcs.write(Field::GuestDr7, g.dr7)?;
        vmcs.write(Field::GuestRsp, g.rsp)?;
        vmcs.write(Field::GuestRip, g.rip)?;
        vmcs.write(Field::GuestRflags, g.rflags)?;
        vmcs.write(Field::GuestActivityState, g.activity_state)?;
        vmcs.write(Field::GuestInterruptibilityState, g.interruptibility)?;
        vmcs.write(Field::GuestPendingDbgExceptions, 0)?;
        vmcs.write(Field::GuestLinkPointer, g.link_pointer)
    }

    fn commit_control(&self, vmcs: &ActiveVmcs) -> Result<(), VmError> {
        let c = &self.ctrl;
        vmcs.write(Field::Vpid, c.vpid)?;
        vmcs.write(
            Field::PinBasedControls,
            capability_adjust(c.pin.bits(), Msr::<IA32_VMX_PINBASED_CTLS>::read()),
        )?;
        vmcs.write(
            Field::ProcBasedControls,
            capability_adjust(c.proc1.bits(), Msr::<IA32_VMX_PROC_BASED_CTLS>::read()),
        )?;
        vmcs.write(
            Field::SecondaryControls,
            capability_adjust(c.proc2.bits(), Msr::<IA32_VMX_PROC_BASED_CTLS2>::read()),
        )?;
        vmcs.write(
            Field::VmentryControls,
            capability_adjust(c.entry.bits(), Msr::<IA32_VMX_ENTRY_CTLS>::read()),
        )?;
        vmcs.write(
            Field::VmexitControls,
            capability_adjust(c.exit.bits(), Msr::<IA32_VMX_EXIT_CTLS>::read()),
        )?;
        vmcs.write(Field::ExceptionBitmap, c.exception_bitmap)?;
        vmcs.write(Field::Eptptr, c.eptp)?;
        vmcs.write(Field::ApicAccessAddr, c.apic_access_addr)?;
        vmcs.write(Field::MsrBitmaps, c.msr_bitmap_addr)?;
        vmcs.write(Field::TprThreshold, c.tpr_threshold)?;
        vmcs.write(Field::VmentryInterruptionInfo, c.entry_interruption_info)?;
        vmcs.write(Field::VmentryExceptionErrCode, 0)?;
        vmcs.write(Field::VmentryInstructionLength, 0)?;
        vmcs.write(Field::Cr3TargetCount, 0)?;
        vmcs.write(Field::PageFaultErrCodeMask, 0)?;
        vmcs.write(Field::PageFaultErrCodeMatch, 0)?;
        vmcs.write(Field::VmexitMsrStoreCount, 0)?;
        vmcs.write(Field::VmexitMsrLoadCount, 0)?;
        vmcs.write(Field::VmentryMsrLoadCount, 0)?;
        vmcs.write(Field::Cr0GuestHostMask, 0)?;
        vmcs.write(Field::Cr4GuestHostMask, 0)?;
        vmcs.write(Field::Cr0ReadShadow, self.guest.cr0)?;
        vmcs.write(Field::Cr4ReadShadow, self.guest.cr4)
    }
}

/// Force the reserved bits of a control word to the values the capability
/// MSR requires: the low half is the allowed-0 mask (bits that must be 1),
/// the high half the allowed-1 mask (bits that may be 1).
fn capability_adjust(requested: u32, capability: u64) -> u64 {
    let allowed0 = capability as u32;
    let allowed1 = (capability >> 32) as u32;
    ((requested | allowed0) & allowed1) as u64
}
