//! veil: a bare-metal type-1 hypervisor core built on the x86-64 VMX
//! extensions.
//!
//! The crate owns four things and nothing else:
//!
//! - the extended-page-table manager ([`ept`], [`space`]) that translates
//!   guest-physical to host-physical addresses for one virtual processor;
//! - the VMCS layer ([`vmcs`], [`snapshot`]) that mirrors every
//!   virtual-machine-control-structure field in memory and commits the
//!   mirror to hardware in the order the processor requires;
//! - the VM-exit dispatcher ([`vmexits`]) that is re-entered by hardware on
//!   every trap and either repairs guest state and resumes, or performs a
//!   privileged side effect first, including re-homing a nested guest's
//!   VMX instructions onto a shadow VMCS;
//! - the vproc lifecycle ([`vm`], [`vcpu`]) that ties the three together
//!   and threads multi-core joins.
//!
//! Everything the hypervisor consumes from the machine (frames, the
//! linear map, MSRs, the local APIC, the console) comes from `bedrock`.
//!
//! Control transfers into a guest through [`vcpu::Vproc::run`], the single
//! suspension point of the whole system: it only returns to its caller on
//! the next hardware trap, and every other operation in this crate is
//! synchronous.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod acpi;
pub mod elf;
pub mod ept;
pub mod probe;
pub mod snapshot;
pub mod space;
pub mod vcpu;
pub mod vm;
pub mod vm_control;
pub mod vmcs;
pub mod vmexits;

pub use probe::Probe;

#[cfg(test)]
pub(crate) mod test_support {
    use bedrock::addressing::Va;

    /// Foster one shared frame pool for the whole test binary.
    pub(crate) fn init_mm() {
        static ONCE: spin::Once<()> = spin::Once::new();
        ONCE.call_once(|| {
            let backing = Box::leak(vec![0u8; 128 << 20].into_boxed_slice());
            let start = Va::new(backing.as_ptr() as usize).unwrap();
            let end = Va::new(backing.as_ptr() as usize + backing.len()).unwrap();
            unsafe { bedrock::mm::init(start, end) };
        });
    }
}

use alloc::boxed::Box;
use bedrock::cpu::Cr4;
use bedrock::msr::{Msr, IA32_FEATURE_CONTROL};
use vmcs::{ExitReason, InstructionError, Vmcs};

/// Errors of the hypervisor core.
///
/// Almost nothing here is recoverable: a hardware-rejected VMX operation
/// or a violated capacity limit halts the core with a diagnostic. The
/// error type exists so handlers can decline an exit
/// ([`VmError::HandleVmexitFailed`]) and let the next controller in the
/// chain try.
pub enum VmError {
    /// A VMX instruction failed its validity check.
    VmxOperationError(InstructionError),
    /// No controller accepted this vmexit.
    HandleVmexitFailed(ExitReason),
    /// The trapping instruction could not be decoded.
    FailedToDecodeInstruction,
    /// A guest-supplied address did not resolve through the EPT.
    UnmappedGuestAddress(vm::Gpa),
    /// Controller-specific failure.
    ControllerError(Box<dyn core::fmt::Debug + Send>),
}

impl core::fmt::Debug for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::VmxOperationError(e) => write!(f, "VmxOperationError({:?})", e),
            Self::HandleVmexitFailed(r) => write!(f, "HandleVmexitFailed({:?})", r),
            Self::FailedToDecodeInstruction => write!(f, "FailedToDecodeInstruction"),
            Self::UnmappedGuestAddress(gpa) => write!(f, "UnmappedGuestAddress({:?})", gpa),
            Self::ControllerError(e) => write!(f, "ControllerError({:?})", e),
        }
    }
}

/// Phase of the boot sequence.
///
/// The one-shot operations of bring-up (ACPI table relocation in
/// particular) are guarded by this phase value instead of a hidden
/// first-call latch; the boot path owns the value and hands it to the
/// operations that advance it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    /// Firmware tables are still at their firmware-provided locations.
    Early,
    /// ACPI tables have been relocated into guest-physical space.
    AcpiRelocated,
    /// A guest is running.
    Running,
}

/// Enter VMX root operation on the calling core.
///
/// Checks the feature-control MSR, sets CR4.VMXE and executes VMXON on a
/// freshly allocated region. Must run once per core before any vproc is
/// loaded on it.
///
/// # Safety
/// Privileged; changes the processor operating mode.
pub unsafe fn start_vmx_on_cpu() -> Result<(), VmError> {
    // Bit 0: lock, bit 2: enable VMXON outside SMX.
    let feature = Msr::<IA32_FEATURE_CONTROL>::read();
    if feature & 1 == 0 {
        Msr::<IA32_FEATURE_CONTROL>::write(feature | 0b101);
    } else if feature & 0b100 == 0 {
        panic!("VMX is disabled by firmware");
    }

    (Cr4::current() | Cr4::VMXE).apply();

    // The VMXON region lives for the lifetime of the core.
    let region = Box::leak(Box::new(Vmcs::new()));
    region.on().map_err(VmError::VmxOperationError)
}
