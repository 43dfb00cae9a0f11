//! Hypercall vmexit controller.
//!
//! A hypercall is a VMCALL with the operation code in `rax` and arguments
//! in `rdi`, `rsi`, `rdx`. The ABI is open and additive: codes this build
//! does not recognize are accepted no-ops, so newer guests keep running
//! on older hypervisors.

use crate::vcpu::VmexitResult;
use crate::vm::Gpa;
use crate::vmcs::{BasicExitReason, TrapEvent};
use crate::vmexits::{VmexitController, VprocContext};
use crate::VmError;
use num_enum::TryFromPrimitive;

/// Operation codes of the hypercall ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u64)]
pub enum HypercallCode {
    /// Narrow the kernel text mapping to execute-only.
    ///
    /// rdi = guest-physical base, rsi = length.
    MarkKernelExecuteOnly = 1,
    /// Resolve a DMA target: store the host-physical address of the
    /// source into the first 8 bytes of the answer location.
    ///
    /// rdi = guest-physical source, rsi = guest-physical answer location.
    MapDmaTarget = 6,
    /// Dump translation-tree statistics to the hypervisor log.
    MemoryDebugDump = 9,
    /// Enable delivery of one external interrupt line to this guest.
    ///
    /// rdi = vector.
    EnableInterruptLine = 10,
}

/// Hypercall vmexit controller.
pub struct Controller {}

impl Controller {
    /// Create a new hypercall controller.
    pub fn new() -> Self {
        Self {}
    }

    fn dispatch(
        &mut self,
        code: HypercallCode,
        ctx: &mut VprocContext<'_>,
    ) -> Result<(), VmError> {
        match code {
            HypercallCode::MapDmaTarget => {
                let src = Gpa::new(ctx.gprs.rdi).ok_or(VmError::FailedToDecodeInstruction)?;
                let dst = Gpa::new(ctx.gprs.rsi).ok_or(VmError::FailedToDecodeInstruction)?;
                let resolved = ctx.translate(src)?;
                // The answer goes out through a temporary host mapping of
                // the destination frame.
                ctx.write_guest(
                    dst,
                    &(unsafe { resolved.into_usize() } as u64).to_le_bytes(),
                )
            }
            #[cfg(feature = "kernel-xo")]
            HypercallCode::MarkKernelExecuteOnly => {
                use crate::ept::{CachePolicy, Permission};
                let base = ctx.gprs.rdi & !bedrock::addressing::PAGE_MASK;
                let len = ctx.gprs.rsi;
                let mut ept = ctx.ept.lock();
                for gpa in (base..base + len).step_by(bedrock::addressing::PAGE_SIZE) {
                    let gpa = Gpa::new(gpa).ok_or(VmError::FailedToDecodeInstruction)?;
                    if let Some(pa) = ept.walk(gpa) {
                        unsafe {
                            ept.map_page(gpa, pa, Permission::EXECUTABLE, CachePolicy::WriteBack)
                                .map_err(|e| VmError::ControllerError(alloc::boxed::Box::new(e)))?;
                        }
                    }
                }
                Ok(())
            }
            #[cfg(not(feature = "kernel-xo"))]
            HypercallCode::MarkKernelExecuteOnly => Ok(()),
            HypercallCode::MemoryDebugDump => {
                let ept = ctx.ept.lock();
                log::info!(
                    "vproc{}: {} guest pages mapped, root {:?}",
                    ctx.id,
                    ept.mapped_pages(),
                    ept.root_pa()
                );
                Ok(())
            }
            HypercallCode::EnableInterruptLine => {
                log::debug!("vproc{}: interrupt line {} enabled", ctx.id, ctx.gprs.rdi);
                Ok(())
            }
        }
    }
}

impl VmexitController for Controller {
    fn handle(
        &mut self,
        event: &TrapEvent,
        ctx: &mut VprocContext<'_>,
    ) -> Result<VmexitResult, VmError> {
        match event.basic_reason() {
            BasicExitReason::Vmcall => {
                if let Ok(code) = HypercallCode::try_from(ctx.gprs.rax as u64) {
                    self.dispatch(code, ctx)?;
                }
                // Unknown codes fall through: accepted, no effect.
                ctx.snapshot.advance_rip(event.instruction_length);
                Ok(VmexitResult::Ok)
            }
            _ => Err(VmError::HandleVmexitFailed(event.reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ept::{CachePolicy, ExtendedPageTable, Permission};
    use crate::snapshot::VmcsSnapshot;
    use crate::test_support::init_mm;
    use crate::vcpu::SipiTracker;
    use crate::vmexits::SmpJoin;
    use alloc::sync::Arc;
    use bedrock::mm::Page;
    use spin::Mutex as SpinLock;

    struct NoJoin;
    impl SmpJoin for NoJoin {
        fn join_core(&self, _: u32, _: u8, _: u8) -> Result<(), VmError> {
            unreachable!()
        }
    }

    fn vmcall_event() -> TrapEvent {
        TrapEvent::synthetic(BasicExitReason::Vmcall, 0, 3)
    }

    #[test]
    fn map_dma_target_resolves_source() {
        init_mm();
        let ept = Arc::new(SpinLock::new(ExtendedPageTable::new(0xD2)));
        let (src_gpa, dst_gpa) = (0x8000, 0x9000);
        let src_pa = {
            let mut ept = ept.lock();
            let src = Page::new().unwrap();
            let pa = src.pa();
            ept.map(
                Gpa::new(src_gpa).unwrap(),
                src,
                Permission::all(),
                CachePolicy::WriteBack,
            )
            .unwrap();
            ept.map(
                Gpa::new(dst_gpa).unwrap(),
                Page::new().unwrap(),
                Permission::all(),
                CachePolicy::WriteBack,
            )
            .unwrap();
            pa
        };

        let mut snapshot = VmcsSnapshot::default();
        let mut gprs = bedrock::cpu::GeneralPurposeRegisters::default();
        gprs.rax = HypercallCode::MapDmaTarget as u64 as usize;
        gprs.rdi = src_gpa;
        gprs.rsi = dst_gpa;
        let mut shadow = None;
        let mut sipi = SipiTracker::default();
        let mut ctx = VprocContext {
            id: 4,
            snapshot: &mut snapshot,
            gprs: &mut gprs,
            ept: &ept,
            shadow: &mut shadow,
            sipi: &mut sipi,
            smp: &NoJoin,
        };

        let mut c = Controller::new();
        assert!(matches!(
            c.handle(&vmcall_event(), &mut ctx),
            Ok(VmexitResult::Ok)
        ));

        let mut answer = [0u8; 8];
        ctx.read_guest(Gpa::new(dst_gpa).unwrap(), &mut answer)
            .unwrap();
        assert_eq!(
            u64::from_le_bytes(answer),
            unsafe { src_pa.into_usize() } as u64
        );
        assert_eq!(snapshot.guest.rip, 3);

        ept.lock().release_frames();
    }

    #[test]
    fn unknown_codes_are_accepted_no_ops() {
        init_mm();
        let ept = Arc::new(SpinLock::new(ExtendedPageTable::new(0xD3)));
        let mut snapshot = VmcsSnapshot::default();
        snapshot.guest.rip = 0x100;
        let mut gprs = bedrock::cpu::GeneralPurposeRegisters::default();
        gprs.rax = 0xdead;
        let mut shadow = None;
        let mut sipi = SipiTracker::default();
        let mut ctx = VprocContext {
            id: 5,
            snapshot: &mut snapshot,
            gprs: &mut gprs,
            ept: &ept,
            shadow: &mut shadow,
            sipi: &mut sipi,
            smp: &NoJoin,
        };

        let mut c = Controller::new();
        assert!(matches!(
            c.handle(&vmcall_event(), &mut ctx),
            Ok(VmexitResult::Ok)
        ));
        // The guest resumes past the VMCALL with nothing else changed.
        assert_eq!(snapshot.guest.rip, 0x103);
        assert_eq!(gprs.rax, 0xdead);
    }
}
