//! Virtual processor.
//!
//! A [`Vproc`] ties one EPT tree, one hardware VMCS region plus its
//! in-memory snapshot, and the saved register state into the unit the
//! dispatcher operates on. [`Vproc::run`] is the only place control leaves
//! the hypervisor: it commits the snapshot, transfers into the guest, and
//! comes back on the next hardware trap with the exit decoded into a
//! [`crate::vmcs::TrapEvent`].

use crate::ept::ExtendedPageTable;
use crate::snapshot::VmcsSnapshot;
use crate::vmcs::{BasicExitReason, Field, Vmcs};
use crate::vmexits::{SmpJoin, VmexitController, VprocContext};
use crate::VmError;
use alloc::boxed::Box;
use alloc::sync::Arc;
use bedrock::cpu::{FxArea, GeneralPurposeRegisters};
use bedrock::mm::Page;
use core::arch::naked_asm;
use crossbeam_queue::{ArrayQueue, SegQueue};
use spin::Mutex as SpinLock;

/// Identifier of a vproc; 0 is reserved.
pub type VprocId = u32;

/// Deepest backlog of deferred interrupt vectors.
const PENDING_INTERRUPT_DEPTH: usize = 64;

#[unsafe(naked)]
unsafe extern "C" fn vmenter(_gprs: &mut GeneralPurposeRegisters, _launched: &mut u64) -> i8 {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "push rdi",
        "clc",
        // Refresh the host stack pointer for this core before entering.
        "mov rax, 0x6c14", // HostRsp.
        "vmwrite rax, rsp",
        "setna al",
        "cmp al, 0",
        "je 1f",
        // The write was rejected; unwind and report.
        "pop rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "mov al, 1",
        "ret",
        "1:",
        // Flip the launched flag, remembering whether it was set.
        "mov rax, [rsi]",
        "cmp rax, 1",
        "mov rax, 1",
        "mov [rsi], rax",
        // Load the guest register block, CR2 included.
        "mov rax, [rdi + 0x78]",
        "mov cr2, rax",
        "mov rax, [rdi + 0x70]",
        "mov rbx, [rdi + 0x68]",
        "mov rcx, [rdi + 0x60]",
        "mov rdx, [rdi + 0x58]",
        "mov rbp, [rdi + 0x50]",
        "mov rsi, [rdi + 0x40]",
        "mov r8, [rdi + 0x38]",
        "mov r9, [rdi + 0x30]",
        "mov r10, [rdi + 0x28]",
        "mov r11, [rdi + 0x20]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x10]",
        "mov r14, [rdi + 0x8]",
        "mov r15, [rdi]",
        "mov rdi, [rdi + 0x48]",
        "jne 2f",
        "vmresume",
        "jmp 3f",
        "2:",
        "vmlaunch",
        "3:",
        // Entry fell through: the launch itself failed.
        "pop rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "mov al, 2",
        "ret",
    )
}

/// VM-exit landing point; the VMCS host RIP field points here.
#[unsafe(naked)]
unsafe extern "C" fn vmexit_entry() {
    naked_asm!(
        // Stash the guest rdi, recover the register-block pointer pushed
        // by vmenter, and spill the guest state into it.
        "sub rsp, 8",
        "mov [rsp], rdi",
        "mov rdi, [rsp + 8]",
        "mov [rdi + 0x70], rax",
        "mov rax, cr2",
        "mov [rdi + 0x78], rax",
        "mov [rdi + 0x68], rbx",
        "mov [rdi + 0x60], rcx",
        "mov [rdi + 0x58], rdx",
        "mov [rdi + 0x50], rbp",
        "mov [rdi + 0x40], rsi",
        "mov [rdi + 0x38], r8",
        "mov [rdi + 0x30], r9",
        "mov [rdi + 0x28], r10",
        "mov [rdi + 0x20], r11",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x8], r14",
        "mov [rdi], r15",
        "mov rax, [rsp]",
        "mov [rdi + 0x48], rax",
        "add rsp, 16",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "xor rax, rax",
        "ret",
    )
}

/// Address of the VM-exit landing point for the host-state area.
pub fn vmexit_entry_addr() -> u64 {
    vmexit_entry as usize as u64
}

/// INIT-SIPI-SIPI bring-up tracker for one vproc.
///
/// The guest signals an additional logical core with the standard
/// three-step sequence through its local APIC; the third signal is what
/// actually joins a physical core.
#[derive(Debug, Default)]
pub struct SipiTracker {
    signals: u8,
    /// Destination APIC id of the sequence in flight.
    pub target: u8,
    /// Start-up vector (page number) from the last SIPI.
    pub vector: u8,
}

impl SipiTracker {
    /// Record an INIT toward `target`; restarts the sequence.
    pub fn signal_init(&mut self, target: u8) {
        self.signals = 1;
        self.target = target;
    }

    /// Record a SIPI; returns true on the third signal of the sequence,
    /// resetting the tracker.
    pub fn signal_sipi(&mut self, vector: u8) -> bool {
        if self.signals == 0 {
            // SIPI without INIT; ignore.
            return false;
        }
        self.vector = vector;
        self.signals += 1;
        if self.signals == 3 {
            self.signals = 0;
            true
        } else {
            false
        }
    }
}

/// What a completed dispatch round tells the caller.
pub enum VmexitResult {
    /// Guest state repaired; resume it.
    Ok,
    /// The guest halted with an exit code.
    Exited(i32),
    /// A host-owned external interrupt arrived; the caller decides what
    /// to do with the vector.
    ExtInt(u8),
}

/// One virtual processor.
pub struct Vproc {
    /// Unique, monotonically assigned identifier; 0 is reserved.
    pub id: VprocId,
    /// Hardware VMCS region backing this vproc.
    vmcs: Box<Vmcs>,
    /// The in-memory mirror committed before every resume.
    pub snapshot: VmcsSnapshot,
    /// Saved general-purpose registers of the guest.
    pub gprs: GeneralPurposeRegisters,
    /// Saved SSE/x87 state of the guest.
    fx: Box<FxArea>,
    /// Guest-physical translation tree, shared with joined vprocs.
    pub ept: Arc<SpinLock<ExtendedPageTable>>,
    /// APIC-access page, shared with joined vprocs.
    pub apic_page: Arc<Page>,
    /// Whether the region has been launched since its last VMCLEAR.
    launched: u64,
    /// Interrupt vectors awaiting an interruptible guest, FIFO.
    pending_interrupts: ArrayQueue<u8>,
    /// Out-of-band VMCS field writes, applied in enqueue order before the
    /// next resume.
    field_writes: SegQueue<(Field, u64)>,
    /// INIT/SIPI bring-up progress.
    pub sipi: SipiTracker,
    /// Shadow-VMCS record; present only once the guest turns on VMX.
    pub shadow: Option<crate::vmexits::nested::ShadowVmcs>,
}

impl Vproc {
    /// Assemble a vproc around an already-built address space.
    ///
    /// `vmcs_region` must be freshly created; guest-visible state is
    /// seeded from `snapshot` at the first [`Vproc::load`].
    pub fn new(
        id: VprocId,
        vmcs: Box<Vmcs>,
        snapshot: VmcsSnapshot,
        ept: Arc<SpinLock<ExtendedPageTable>>,
        apic_page: Arc<Page>,
    ) -> Self {
        assert_ne!(id, 0, "vproc id 0 is reserved");
        Self {
            id,
            vmcs,
            snapshot,
            gprs: GeneralPurposeRegisters::default(),
            fx: Box::new(FxArea::default()),
            ept,
            apic_page,
            launched: 0,
            pending_interrupts: ArrayQueue::new(PENDING_INTERRUPT_DEPTH),
            field_writes: SegQueue::new(),
            sipi: SipiTracker::default(),
            shadow: None,
        }
    }

    /// Host-physical address of the backing VMCS region; the dispatcher's
    /// reverse-lookup key.
    pub fn vmcs_pa(&self) -> bedrock::addressing::Pa {
        self.vmcs.pa()
    }

    /// Deliver an external interrupt to the guest: inject immediately when
    /// the guest can take it, otherwise append to the FIFO backlog and ask
    /// for an interrupt-window exit.
    pub fn queue_interrupt(&mut self, vector: u8) {
        if self.snapshot.interruptible()
            && !self.snapshot.injection_armed()
            && self.pending_interrupts.is_empty()
        {
            self.snapshot.inject_interrupt(vector);
        } else {
            if self.pending_interrupts.push(vector).is_err() {
                log::warn!("vproc{}: pending-interrupt queue full, vector {} dropped", self.id, vector);
            }
            self.snapshot.set_interrupt_window(true);
        }
    }

    /// The guest opened an interrupt window: deliver exactly one backlogged
    /// vector and drop window exiting once the backlog drains.
    pub fn service_interrupt_window(&mut self) {
        if self.snapshot.interruptible() && !self.snapshot.injection_armed() {
            if let Some(vector) = self.pending_interrupts.pop() {
                self.snapshot.inject_interrupt(vector);
            }
        }
        if self.pending_interrupts.is_empty() {
            self.snapshot.set_interrupt_window(false);
        }
    }

    /// Vectors currently backlogged.
    pub fn pending_interrupts(&self) -> usize {
        self.pending_interrupts.len()
    }

    /// Queue a VMCS field write to be applied, in enqueue order,
    /// immediately before the next resume of this vproc.
    pub fn queue_field_write(&self, field: Field, value: u64) {
        self.field_writes.push((field, value));
    }

    /// Drain the modification queue into the snapshot so the next commit
    /// carries the writes and local reads observe them now.
    pub fn drain_field_writes(&mut self) {
        while let Some((field, value)) = self.field_writes.pop() {
            if !self.snapshot.store(field, value) {
                log::warn!(
                    "vproc{}: queued write to unmirrored field {:?} ignored",
                    self.id,
                    field
                );
            }
        }
    }

    /// Point the hardware at this vproc's region and flush the snapshot.
    ///
    /// A previously launched region is VMCLEARed first; reuse without the
    /// clear is rejected by the processor.
    pub fn load(&mut self) -> Result<(), VmError> {
        if self.launched != 0 {
            self.vmcs.clear()?;
            self.launched = 0;
        }
        let active = self.vmcs.activate()?;
        self.snapshot.host.rip = vmexit_entry_addr();
        self.snapshot.commit(&active)
    }

    /// Run the guest until it produces a result the caller must act on.
    ///
    /// This is the coroutine boundary of the whole hypervisor: each loop
    /// iteration commits the snapshot, transfers into the guest, and
    /// deterministically terminates by resuming again, returning, or
    /// halting on an unhandled exit.
    pub fn run<C: VmexitController>(
        &mut self,
        controller: &mut C,
        smp: &dyn SmpJoin,
    ) -> Result<VmexitResult, VmError> {
        loop {
            // An emulated VMLAUNCH re-homes this vproc onto its shadow
            // region: park the L1 context and mirror the nested guest's
            // state instead.
            let pending_nested = self
                .shadow
                .as_mut()
                .map(|s| s.take_pending_entry())
                .unwrap_or(false);
            if pending_nested {
                let shadow = self.shadow.as_mut().unwrap();
                unsafe { shadow.enter(&self.snapshot)? };
                shadow.engage(&self.snapshot, &self.gprs);
                self.shadow
                    .as_ref()
                    .unwrap()
                    .seed_mirror(&mut self.snapshot);
            }
            let engaged = self.shadow.as_ref().map(|s| s.engaged()).unwrap_or(false);
            let active = if engaged {
                let pa = self.shadow.as_ref().unwrap().region_pa();
                unsafe { crate::vmcs::ActiveVmcs::activate_pa(pa)? }
            } else {
                self.vmcs.activate()?
            };
            self.drain_field_writes();
            self.snapshot.commit(&active)?;

            unsafe { self.fx.restore() };
            let launched = if engaged {
                self.shadow.as_mut().unwrap().launched_mut()
            } else {
                &mut self.launched
            };
            let rc = unsafe { vmenter(&mut self.gprs, launched) };
            unsafe { self.fx.save() };
            if rc != 0 {
                return Err(VmError::VmxOperationError(Vmcs::instruction_error()));
            }

            // Hardware consumed any armed injection at entry and has been
            // mutating guest state since; re-mirror before handlers look.
            self.snapshot.clear_injection();
            self.refresh_snapshot(&active)?;
            let event = active.trap_event()?;

            match event.basic_reason() {
                BasicExitReason::ExternalInt(Some(info)) => {
                    return Ok(VmexitResult::ExtInt(info.vector));
                }
                BasicExitReason::ExternalInt(None) => {}
                BasicExitReason::InterruptWindow => self.service_interrupt_window(),
                BasicExitReason::Hlt => return Ok(VmexitResult::Exited(0)),
                BasicExitReason::TripleFault => {
                    bedrock::println!(
                        "vproc{}: triple fault at rip {:#x}",
                        self.id,
                        self.snapshot.guest.rip
                    );
                    panic!("guest triple fault");
                }
                _ => {
                    let mut ctx = VprocContext {
                        id: self.id,
                        snapshot: &mut self.snapshot,
                        gprs: &mut self.gprs,
                        ept: &self.ept,
                        shadow: &mut self.shadow,
                        sipi: &mut self.sipi,
                        smp,
                    };
                    match controller.handle(&event, &mut ctx) {
                        Ok(VmexitResult::Ok) => {}
                        Ok(r) => return Ok(r),
                        Err(VmError::HandleVmexitFailed(reason)) => {
                            bedrock::println!(
                                "vproc{}: unhandled vmexit {:?} at rip {:#x}",
                                self.id,
                                reason,
                                self.snapshot.guest.rip
                            );
                            panic!("unhandled vmexit");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    fn refresh_snapshot(&mut self, active: &crate::vmcs::ActiveVmcs) -> Result<(), VmError> {
        let g = &mut self.snapshot.guest;
        g.rip = active.read(Field::GuestRip)?;
        g.rsp = active.read(Field::GuestRsp)?;
        g.rflags = active.read(Field::GuestRflags)?;
        g.cr0 = active.read(Field::GuestCr0)?;
        g.cr3 = active.read(Field::GuestCr3)?;
        g.cr4 = active.read(Field::GuestCr4)?;
        g.efer = active.read(Field::GuestIa32Efer)?;
        g.interruptibility = active.read(Field::GuestInterruptibilityState)?;
        g.activity_state = active.read(Field::GuestActivityState)?;
        Ok(())
    }

    /// Tear the vproc apart for destruction, in the order the lifecycle
    /// requires: the caller has already unregistered us, so nothing can
    /// look the vproc up while the pieces fall.
    pub fn dismantle(self) {
        let Self {
            fx,
            vmcs,
            ept,
            apic_page,
            pending_interrupts,
            field_writes,
            ..
        } = self;
        drop(fx);
        drop(vmcs);
        if let Some(ept) = Arc::into_inner(ept) {
            ept.into_inner().free();
        }
        drop(apic_page);
        drop(pending_interrupts);
        drop(field_writes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::init_mm;
    use bedrock::cpu::Rflags;

    fn test_vproc(id: VprocId) -> Vproc {
        init_mm();
        // The region never touches hardware in tests, so a zeroed one is
        // fine in place of Vmcs::new() (which reads a VMX MSR).
        let vmcs = unsafe { Box::<Vmcs>::new_zeroed().assume_init() };
        Vproc::new(
            id,
            vmcs,
            VmcsSnapshot::default(),
            Arc::new(SpinLock::new(ExtendedPageTable::new(id))),
            Arc::new(Page::new().unwrap()),
        )
    }

    #[test]
    fn immediate_injection_when_interruptible() {
        let mut vproc = test_vproc(0xC1);
        vproc.snapshot.guest.rflags |= Rflags::IF.bits();
        vproc.queue_interrupt(0x21);
        assert!(vproc.snapshot.injection_armed());
        assert_eq!(vproc.pending_interrupts(), 0);
        assert!(!vproc.snapshot.interrupt_window());
    }

    #[test]
    fn deferred_injection_fifo_one_per_window() {
        let mut vproc = test_vproc(0xC2);
        // IF clear: vectors back up and window exiting turns on.
        vproc.queue_interrupt(0x21);
        vproc.queue_interrupt(0x30);
        vproc.queue_interrupt(0x31);
        assert!(!vproc.snapshot.injection_armed());
        assert_eq!(vproc.pending_interrupts(), 3);
        assert!(vproc.snapshot.interrupt_window());

        // Guest becomes interruptible; each window delivers one vector in
        // arrival order.
        vproc.snapshot.guest.rflags |= Rflags::IF.bits();
        let mut delivered = Vec::new();
        for _ in 0..3 {
            vproc.service_interrupt_window();
            assert!(vproc.snapshot.injection_armed());
            delivered.push((vproc.snapshot.ctrl.entry_interruption_info & 0xff) as u8);
            vproc.snapshot.clear_injection();
        }
        assert_eq!(delivered, vec![0x21, 0x30, 0x31]);
        assert!(!vproc.snapshot.interrupt_window());
        assert_eq!(vproc.pending_interrupts(), 0);
    }

    #[test]
    fn scenario_deferred_vector_0x21() {
        let mut vproc = test_vproc(0xC3);
        // Guest IF clear at arrival.
        vproc.queue_interrupt(0x21);
        assert_eq!(vproc.pending_interrupts(), 1);
        assert!(vproc.snapshot.interrupt_window());

        vproc.snapshot.guest.rflags |= Rflags::IF.bits();
        vproc.service_interrupt_window();
        assert_eq!(vproc.snapshot.ctrl.entry_interruption_info, 0x8000_0021);
        assert_eq!(vproc.pending_interrupts(), 0);
        assert!(!vproc.snapshot.interrupt_window());
    }

    #[test]
    fn field_writes_apply_in_enqueue_order_and_mirror() {
        let mut vproc = test_vproc(0xC4);
        vproc.queue_field_write(Field::GuestRip, 0x1000);
        vproc.queue_field_write(Field::GuestRip, 0x2000);
        vproc.queue_field_write(Field::GuestRsp, 0x9000);
        vproc.drain_field_writes();
        assert_eq!(vproc.snapshot.guest.rip, 0x2000);
        assert_eq!(vproc.snapshot.guest.rsp, 0x9000);
    }

    #[test]
    fn sipi_tracker_fires_on_third_signal() {
        let mut t = SipiTracker::default();
        assert!(!t.signal_sipi(0x9)); // stray SIPI ignored
        t.signal_init(1);
        assert!(!t.signal_sipi(0x8));
        assert!(t.signal_sipi(0x8));
        assert_eq!(t.target, 1);
        assert_eq!(t.vector, 0x8);
        // The sequence resets after firing.
        assert!(!t.signal_sipi(0x8));
    }
}
