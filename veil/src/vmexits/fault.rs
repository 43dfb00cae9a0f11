//! Guest-fault and timer vmexit controller.
//!
//! The tail of the default chain: EPT violations are a diagnostic halt,
//! EPT misconfigurations are explicitly not yet handled, and the
//! preemption timer is the designed extension point for time-sliced vproc
//! scheduling that nothing implements today.

use crate::vcpu::VmexitResult;
use crate::vmcs::{BasicExitReason, TrapEvent};
use crate::vmexits::{VmexitController, VprocContext};
use crate::VmError;

/// Guest-fault and timer vmexit controller.
pub struct Controller {}

impl Controller {
    /// Create a new fault controller.
    pub fn new() -> Self {
        Self {}
    }
}

/// Cooperative switch between vprocs on preemption-timer expiry.
///
/// TODO: wire the registry's run queue through here once time-sliced
/// multi-guest scheduling lands; until then expiry is a no-op resume.
fn switch_vprocs(_ctx: &mut VprocContext<'_>) {}

impl VmexitController for Controller {
    fn handle(
        &mut self,
        event: &TrapEvent,
        ctx: &mut VprocContext<'_>,
    ) -> Result<VmexitResult, VmError> {
        match event.basic_reason() {
            BasicExitReason::EptViolation {
                qualification,
                fault_addr,
            } => {
                bedrock::println!(
                    "vproc{}: EPT violation at {:?} (linear {:#x}), access {:?}, rip {:#x}",
                    ctx.id,
                    fault_addr,
                    event.guest_linear,
                    qualification,
                    ctx.snapshot.guest.rip
                );
                panic!("guest EPT violation");
            }
            // Not yet handled: with the current control settings this exit
            // is believed unreachable, and guessing a behavior here would
            // be worse than resuming.
            BasicExitReason::EptMisconfig => Ok(VmexitResult::Ok),
            BasicExitReason::VmxPreemptTimer => {
                switch_vprocs(ctx);
                Ok(VmexitResult::Ok)
            }
            _ => Err(VmError::HandleVmexitFailed(event.reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ept::ExtendedPageTable;
    use crate::test_support::init_mm;
    use crate::vcpu::SipiTracker;
    use crate::vmexits::SmpJoin;
    use alloc::sync::Arc;
    use spin::Mutex as SpinLock;

    struct NoJoin;
    impl SmpJoin for NoJoin {
        fn join_core(&self, _: u32, _: u8, _: u8) -> Result<(), VmError> {
            unreachable!()
        }
    }

    fn run(reason: BasicExitReason) -> Result<VmexitResult, VmError> {
        init_mm();
        let ept = Arc::new(SpinLock::new(ExtendedPageTable::new(0xFA)));
        let mut snapshot = crate::snapshot::VmcsSnapshot::default();
        let mut gprs = bedrock::cpu::GeneralPurposeRegisters::default();
        let mut shadow = None;
        let mut sipi = SipiTracker::default();
        let mut ctx = VprocContext {
            id: 2,
            snapshot: &mut snapshot,
            gprs: &mut gprs,
            ept: &ept,
            shadow: &mut shadow,
            sipi: &mut sipi,
            smp: &NoJoin,
        };
        Controller::new().handle(&TrapEvent::synthetic(reason, 0, 0), &mut ctx)
    }

    #[test]
    fn misconfiguration_is_an_explicit_no_op() {
        assert!(matches!(
            run(BasicExitReason::EptMisconfig),
            Ok(VmexitResult::Ok)
        ));
    }

    #[test]
    fn preemption_timer_resumes_without_switching() {
        assert!(matches!(
            run(BasicExitReason::VmxPreemptTimer),
            Ok(VmexitResult::Ok)
        ));
    }

    #[test]
    fn unrelated_exits_fall_through() {
        assert!(matches!(
            run(BasicExitReason::Hlt),
            Err(VmError::HandleVmexitFailed(_))
        ));
    }
}
