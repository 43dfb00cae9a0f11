//! Cpuid vmexit controller.
//!
//! The guest's CPUID traps here; the answer is the host's, with one
//! repair: leaf 1 carries the initial APIC id of the executing core in
//! EBX, which must report the vproc, not whichever physical core we
//! happen to be on.

use crate::vcpu::VmexitResult;
use crate::vmcs::{BasicExitReason, TrapEvent};
use crate::vmexits::{VmexitController, VprocContext};
use crate::VmError;
use core::arch::x86_64::__cpuid_count;

/// Cpuid vmexit controller.
pub struct Controller {}

impl Controller {
    /// Create a new cpuid controller.
    pub fn new() -> Self {
        Self {}
    }
}

impl VmexitController for Controller {
    fn handle(
        &mut self,
        event: &TrapEvent,
        ctx: &mut VprocContext<'_>,
    ) -> Result<VmexitResult, VmError> {
        match event.basic_reason() {
            BasicExitReason::Cpuid => {
                let (leaf, subleaf) = (ctx.gprs.rax as u32, ctx.gprs.rcx as u32);
                let mut r = unsafe { __cpuid_count(leaf, subleaf) };
                if leaf == 1 {
                    r.ebx = (r.ebx & 0x00ff_ffff) | ((ctx.id as u32 & 0xff) << 24);
                }
                ctx.gprs.rax = r.eax as usize;
                ctx.gprs.rbx = r.ebx as usize;
                ctx.gprs.rcx = r.ecx as usize;
                ctx.gprs.rdx = r.edx as usize;
                ctx.snapshot.advance_rip(event.instruction_length);
                Ok(VmexitResult::Ok)
            }
            _ => Err(VmError::HandleVmexitFailed(event.reason)),
        }
    }
}
