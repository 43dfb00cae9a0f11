//! VM-exit dispatch.
//!
//! Handlers are controllers chained into tuples: each either accepts the
//! exit and repairs guest state, or declines with
//! [`VmError::HandleVmexitFailed`] so the next controller in the chain can
//! try. The chain the lifecycle installs covers every exit the design
//! handles; whatever falls off the end is a diagnostic halt, not a silent
//! fallthrough.

use crate::ept::ExtendedPageTable;
use crate::snapshot::VmcsSnapshot;
use crate::vcpu::{SipiTracker, VmexitResult, VprocId};
use crate::vm::Gpa;
use crate::vmcs::TrapEvent;
use crate::VmError;
use alloc::sync::Arc;
use bedrock::addressing::{Pa, PAGE_MASK, PAGE_SIZE};
use spin::Mutex as SpinLock;

pub mod apic;
pub mod cpuid;
pub mod fault;
pub mod hypercall;
pub mod nested;

/// Hook through which the APIC-access handler joins a second physical
/// core into an already-running guest.
pub trait SmpJoin {
    /// Send the physical INIT/SIPI pair for `vproc` toward `target_apic`,
    /// waiting for delivery acknowledgment.
    fn join_core(&self, vproc: VprocId, target_apic: u8, entry_vector: u8) -> Result<(), VmError>;
}

/// The mutable slice of a vproc a handler operates on.
pub struct VprocContext<'a> {
    /// Identifier of the trapping vproc.
    pub id: VprocId,
    /// Its VMCS mirror; handlers mutate this, never hardware.
    pub snapshot: &'a mut VmcsSnapshot,
    /// Its saved general-purpose registers.
    pub gprs: &'a mut bedrock::cpu::GeneralPurposeRegisters,
    /// Its translation tree.
    pub ept: &'a Arc<SpinLock<ExtendedPageTable>>,
    /// Its shadow-VMCS record, once nested VMX is in use.
    pub shadow: &'a mut Option<nested::ShadowVmcs>,
    /// Its INIT/SIPI bring-up progress.
    pub sipi: &'a mut SipiTracker,
    /// Multi-core join plumbing.
    pub smp: &'a dyn SmpJoin,
}

impl VprocContext<'_> {
    /// Resolve a guest-physical address through this vproc's EPT.
    pub fn translate(&self, gpa: Gpa) -> Result<Pa, VmError> {
        self.ept
            .lock()
            .walk(gpa)
            .ok_or(VmError::UnmappedGuestAddress(gpa))
    }

    /// Write `bytes` at guest-physical `gpa` through a temporary host
    /// mapping, released when the write completes.
    pub fn write_guest(&self, gpa: Gpa, bytes: &[u8]) -> Result<(), VmError> {
        assert!(
            (unsafe { gpa.into_usize() } & PAGE_MASK) + bytes.len() <= PAGE_SIZE,
            "guest write crosses a page"
        );
        let hpa = self.translate(gpa)?;
        unsafe {
            core::slice::from_raw_parts_mut(hpa.into_va().into_usize() as *mut u8, bytes.len())
                .copy_from_slice(bytes);
        }
        Ok(())
    }

    /// Read guest memory at guest-physical `gpa`.
    pub fn read_guest(&self, gpa: Gpa, out: &mut [u8]) -> Result<(), VmError> {
        assert!(
            (unsafe { gpa.into_usize() } & PAGE_MASK) + out.len() <= PAGE_SIZE,
            "guest read crosses a page"
        );
        let hpa = self.translate(gpa)?;
        unsafe {
            out.copy_from_slice(core::slice::from_raw_parts(
                hpa.into_va().into_usize() as *const u8,
                out.len(),
            ));
        }
        Ok(())
    }

    /// Fetch the bytes of the trapping instruction through the guest's
    /// own page tables.
    pub fn fetch_instruction(&self, event: &TrapEvent) -> Result<([u8; 15], usize), VmError> {
        use crate::probe::Probe;
        let len = (event.instruction_length as usize).min(15);
        let rip = crate::vm::Gva::new(self.snapshot.guest.rip as usize)
            .ok_or(VmError::FailedToDecodeInstruction)?;
        let ept = self.ept.lock();
        let hva = ept
            .gva2hva(self.snapshot.guest.cr3, rip)
            .ok_or(VmError::FailedToDecodeInstruction)?;
        let mut bytes = [0u8; 15];
        unsafe {
            bytes[..len].copy_from_slice(core::slice::from_raw_parts(
                hva.into_usize() as *const u8,
                len,
            ));
        }
        Ok((bytes, len))
    }
}

/// Controller that defines the action on a vmexit.
pub trait VmexitController {
    /// Handle one exit; decline with [`VmError::HandleVmexitFailed`] to
    /// pass it down the chain.
    fn handle(
        &mut self,
        event: &TrapEvent,
        ctx: &mut VprocContext<'_>,
    ) -> Result<VmexitResult, VmError>;
}

impl VmexitController for () {
    fn handle(
        &mut self,
        event: &TrapEvent,
        _ctx: &mut VprocContext<'_>,
    ) -> Result<VmexitResult, VmError> {
        Err(VmError::HandleVmexitFailed(event.reason))
    }
}

impl<A: VmexitController, B: VmexitController> VmexitController for (A, B) {
    fn handle(
        &mut self,
        event: &TrapEvent,
        ctx: &mut VprocContext<'_>,
    ) -> Result<VmexitResult, VmError> {
        let (a, b) = self;
        match a.handle(event, ctx) {
            Err(VmError::HandleVmexitFailed(_)) => b.handle(event, ctx),
            r => r,
        }
    }
}

/// The controller chain the lifecycle installs on every vproc.
pub type DefaultChain<A> = (
    cpuid::Controller,
    (
        hypercall::Controller,
        (
            apic::Controller<A>,
            (nested::Controller, fault::Controller),
        ),
    ),
);

/// Assemble the default chain around an APIC pass-through sink.
pub fn default_chain<A: apic::ApicSink>(sink: A) -> DefaultChain<A> {
    (
        cpuid::Controller::new(),
        (
            hypercall::Controller::new(),
            (
                apic::Controller::new(sink),
                (nested::Controller::new(), fault::Controller::new()),
            ),
        ),
    )
}
