//! APIC-access vmexit controller.
//!
//! The guest's local-APIC page is virtualized: reads are answered from the
//! real local APIC, ordinary writes pass through to it, and writes to the
//! interrupt command register that spell the INIT-SIPI-SIPI bring-up
//! sequence are intercepted: the third signal joins a second physical
//! core into this guest instead of resetting a real one.
//!
//! Emulation here is deliberately strict: an access pattern this handler
//! does not recognize halts, because guessing would silently corrupt
//! interrupt delivery.

use crate::vcpu::VmexitResult;
use crate::vmcs::{BasicExitReason, TrapEvent};
use crate::vmexits::{VmexitController, VprocContext};
use crate::VmError;
use bedrock::apic::{reg, ICR_INIT, ICR_STARTUP};
use bedrock::cpu::GeneralPurposeRegisters;
use iced_x86::{Decoder, DecoderOptions, Instruction, OpKind, Register};

/// Where pass-through APIC traffic lands.
pub trait ApicSink {
    /// Read a local-APIC register.
    fn read(&self, offset: usize) -> u32;
    /// Write a local-APIC register.
    fn write(&mut self, offset: usize, value: u32);
}

/// Sink backed by the real local APIC of the running core.
pub struct HardwareApic(bedrock::apic::LocalApic);

impl HardwareApic {
    /// Open the running core's APIC.
    ///
    /// # Safety
    /// See [`bedrock::apic::LocalApic::current`].
    pub unsafe fn current() -> Self {
        Self(bedrock::apic::LocalApic::current())
    }
}

impl ApicSink for HardwareApic {
    fn read(&self, offset: usize) -> u32 {
        self.0.read(offset)
    }
    fn write(&mut self, offset: usize, value: u32) {
        unsafe { self.0.write(offset, value) }
    }
}

/// APIC-access vmexit controller.
pub struct Controller<A: ApicSink> {
    sink: A,
    /// Last value the guest put in the ICR destination half.
    icr_hi: u32,
}

/// Access type bits of the APIC-access exit qualification.
const ACCESS_TYPE_SHIFT: u32 = 12;
const ACCESS_READ: u64 = 0;
const ACCESS_WRITE: u64 = 1;

impl<A: ApicSink> Controller<A> {
    /// Create a controller passing non-special traffic to `sink`.
    pub fn new(sink: A) -> Self {
        Self { sink, icr_hi: 0 }
    }

    fn decode(&self, event: &TrapEvent, ctx: &VprocContext<'_>) -> Result<Instruction, VmError> {
        let (bytes, len) = ctx.fetch_instruction(event)?;
        let mut decoder = Decoder::with_ip(64, &bytes[..len], ctx.snapshot.guest.rip, DecoderOptions::NONE);
        let mut insn = Instruction::default();
        if decoder.can_decode() {
            decoder.decode_out(&mut insn);
            Ok(insn)
        } else {
            Err(VmError::FailedToDecodeInstruction)
        }
    }

    fn handle_write(&mut self, offset: usize, value: u32, ctx: &mut VprocContext<'_>) -> Result<(), VmError> {
        match offset {
            reg::ICR_HI => {
                self.icr_hi = value;
                self.sink.write(offset, value);
            }
            reg::ICR_LO => match value & 0x700 {
                ICR_INIT => {
                    ctx.sipi.signal_init((self.icr_hi >> 24) as u8);
                }
                ICR_STARTUP => {
                    if ctx.sipi.signal_sipi(value as u8) {
                        // Third signal of the sequence: bring a physical
                        // core into this guest and wait for delivery.
                        ctx.smp
                            .join_core(ctx.id, ctx.sipi.target, ctx.sipi.vector)?;
                    }
                }
                _ => self.sink.write(offset, value),
            },
            _ => self.sink.write(offset, value),
        }
        Ok(())
    }
}

impl<A: ApicSink> VmexitController for Controller<A> {
    fn handle(
        &mut self,
        event: &TrapEvent,
        ctx: &mut VprocContext<'_>,
    ) -> Result<VmexitResult, VmError> {
        match event.basic_reason() {
            BasicExitReason::ApicAccess => {
                let offset = (event.qualification & 0xfff) as usize;
                let access = (event.qualification >> ACCESS_TYPE_SHIFT) & 0xf;
                let insn = self.decode(event, ctx)?;
                match access {
                    ACCESS_WRITE => {
                        assert!(
                            insn.op0_kind() == OpKind::Memory,
                            "unrecognized APIC write at offset {:#x}",
                            offset
                        );
                        let value = source_value(&insn, ctx.gprs) as u32;
                        self.handle_write(offset, value, ctx)?;
                    }
                    ACCESS_READ => {
                        assert!(
                            insn.op1_kind() == OpKind::Memory,
                            "unrecognized APIC read at offset {:#x}",
                            offset
                        );
                        let value = self.sink.read(offset);
                        store_to_register(insn.op0_register(), value as u64, ctx.gprs);
                    }
                    t => panic!("unrecognized APIC access type {} at offset {:#x}", t, offset),
                }
                ctx.snapshot.advance_rip(event.instruction_length);
                Ok(VmexitResult::Ok)
            }
            _ => Err(VmError::HandleVmexitFailed(event.reason)),
        }
    }
}

fn source_value(insn: &Instruction, gprs: &GeneralPurposeRegisters) -> u64 {
    match insn.op1_kind() {
        OpKind::Register => match insn.op1_register() {
            Register::EAX | Register::RAX => gprs.rax as u64,
            Register::EBX | Register::RBX => gprs.rbx as u64,
            Register::ECX | Register::RCX => gprs.rcx as u64,
            Register::EDX | Register::RDX => gprs.rdx as u64,
            Register::ESI | Register::RSI => gprs.rsi as u64,
            Register::EDI | Register::RDI => gprs.rdi as u64,
            Register::R8D | Register::R8 => gprs.r8 as u64,
            Register::R9D | Register::R9 => gprs.r9 as u64,
            Register::R10D | Register::R10 => gprs.r10 as u64,
            Register::R11D | Register::R11 => gprs.r11 as u64,
            Register::R12D | Register::R12 => gprs.r12 as u64,
            Register::R13D | Register::R13 => gprs.r13 as u64,
            Register::R14D | Register::R14 => gprs.r14 as u64,
            Register::R15D | Register::R15 => gprs.r15 as u64,
            r => panic!("unrecognized APIC write source {:?}", r),
        },
        OpKind::Immediate8 => insn.immediate8() as u64,
        OpKind::Immediate16 => insn.immediate16() as u64,
        OpKind::Immediate32 => insn.immediate32() as u64,
        OpKind::Immediate32to64 => insn.immediate32to64() as u64,
        k => panic!("unrecognized APIC write operand {:?}", k),
    }
}

fn store_to_register(register: Register, value: u64, gprs: &mut GeneralPurposeRegisters) {
    // A 32-bit destination zeroes the upper half, which `as usize` of the
    // truncated value already does.
    let slot = match register {
        Register::EAX | Register::RAX => &mut gprs.rax,
        Register::EBX | Register::RBX => &mut gprs.rbx,
        Register::ECX | Register::RCX => &mut gprs.rcx,
        Register::EDX | Register::RDX => &mut gprs.rdx,
        Register::ESI | Register::RSI => &mut gprs.rsi,
        Register::EDI | Register::RDI => &mut gprs.rdi,
        Register::R8D | Register::R8 => &mut gprs.r8,
        Register::R9D | Register::R9 => &mut gprs.r9,
        Register::R10D | Register::R10 => &mut gprs.r10,
        Register::R11D | Register::R11 => &mut gprs.r11,
        Register::R12D | Register::R12 => &mut gprs.r12,
        Register::R13D | Register::R13 => &mut gprs.r13,
        Register::R14D | Register::R14 => &mut gprs.r14,
        Register::R15D | Register::R15 => &mut gprs.r15,
        r => panic!("unrecognized APIC read destination {:?}", r),
    };
    if register.size() == 4 {
        *slot = (value as u32) as usize;
    } else {
        *slot = value as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ept::ExtendedPageTable;
    use crate::space::{GuestSpace, BOOT_PT_BASE, SECTOR_SIZE};
    use crate::test_support::init_mm;
    use crate::vcpu::SipiTracker;
    use crate::vmexits::SmpJoin;
    use crate::{BootPhase, VmError};
    use alloc::sync::Arc;
    use core::cell::RefCell;
    use spin::Mutex as SpinLock;

    #[derive(Default)]
    struct RecordingSink {
        writes: Vec<(usize, u32)>,
        read_answer: u32,
    }

    impl ApicSink for RecordingSink {
        fn read(&self, _offset: usize) -> u32 {
            self.read_answer
        }
        fn write(&mut self, offset: usize, value: u32) {
            self.writes.push((offset, value));
        }
    }

    #[derive(Default)]
    struct RecordingJoin {
        joins: RefCell<Vec<(u32, u8, u8)>>,
    }

    impl SmpJoin for RecordingJoin {
        fn join_core(&self, vproc: u32, target: u8, vector: u8) -> Result<(), VmError> {
            self.joins.borrow_mut().push((vproc, target, vector));
            Ok(())
        }
    }

    /// Guest-physical home of the fabricated trapping instruction.
    const CODE_GPA: usize = 0x20_0000 - 0x1000;

    /// `mov [abs32], eax` with SIB absolute addressing.
    fn mov_to(addr: u32) -> Vec<u8> {
        let mut b = vec![0x89, 0x04, 0x25];
        b.extend_from_slice(&addr.to_le_bytes());
        b
    }

    /// `mov eax, [abs32]`.
    fn mov_from(addr: u32) -> Vec<u8> {
        let mut b = vec![0x8b, 0x04, 0x25];
        b.extend_from_slice(&addr.to_le_bytes());
        b
    }

    fn guest_tree(owner: u32) -> Arc<SpinLock<ExtendedPageTable>> {
        init_mm();
        let mut image = vec![0u8; SECTOR_SIZE];
        image.extend_from_slice(&crate::elf::tests::sample_image(
            0x10_0000, 0x10_0000, &[0x90; 16],
        ));
        let mut phase = BootPhase::Early;
        let space = GuestSpace::build(owner, &image, 2 << 20, &[], None, &mut phase).unwrap();
        let (ept, _, _) = space.into_parts();
        Arc::new(SpinLock::new(ept))
    }

    fn run_access(
        ept: &Arc<SpinLock<ExtendedPageTable>>,
        controller: &mut Controller<RecordingSink>,
        join: &RecordingJoin,
        sipi: &mut SipiTracker,
        code: &[u8],
        qualification: u64,
        gprs: &mut GeneralPurposeRegisters,
    ) {
        ept.lock().write_bytes(CODE_GPA, code).unwrap();
        let mut snapshot = crate::snapshot::VmcsSnapshot::default();
        snapshot.guest.rip = CODE_GPA as u64;
        snapshot.guest.cr3 = BOOT_PT_BASE as u64;
        let mut shadow = None;
        let event =
            TrapEvent::synthetic(BasicExitReason::ApicAccess, qualification, code.len() as u64);
        let mut ctx = VprocContext {
            id: 7,
            snapshot: &mut snapshot,
            gprs,
            ept,
            shadow: &mut shadow,
            sipi,
            smp: join,
        };
        controller.handle(&event, &mut ctx).unwrap();
        assert_eq!(snapshot.guest.rip, CODE_GPA as u64 + code.len() as u64);
    }

    fn write_access(offset: usize) -> u64 {
        offset as u64 | (ACCESS_WRITE << ACCESS_TYPE_SHIFT)
    }

    #[test]
    fn init_sipi_sipi_joins_on_third_signal() {
        let ept = guest_tree(0xE1);
        let mut c = Controller::new(RecordingSink::default());
        let join = RecordingJoin::default();
        let mut sipi = SipiTracker::default();
        let mut gprs = GeneralPurposeRegisters::default();

        // Destination goes in first (plain pass-through write).
        gprs.rax = 1 << 24;
        run_access(
            &ept,
            &mut c,
            &join,
            &mut sipi,
            &mov_to(0xfee0_0310),
            write_access(reg::ICR_HI),
            &mut gprs,
        );
        assert_eq!(c.icr_hi, 1 << 24);

        let icr_lo = mov_to(0xfee0_0300);
        // INIT.
        gprs.rax = 0xC500;
        run_access(
            &ept,
            &mut c,
            &join,
            &mut sipi,
            &icr_lo,
            write_access(reg::ICR_LO),
            &mut gprs,
        );
        assert!(join.joins.borrow().is_empty());
        // First SIPI.
        gprs.rax = 0xC608;
        run_access(
            &ept,
            &mut c,
            &join,
            &mut sipi,
            &icr_lo,
            write_access(reg::ICR_LO),
            &mut gprs,
        );
        assert!(join.joins.borrow().is_empty());
        // Second SIPI: the third signal of the sequence joins the core.
        run_access(
            &ept,
            &mut c,
            &join,
            &mut sipi,
            &icr_lo,
            write_access(reg::ICR_LO),
            &mut gprs,
        );
        assert_eq!(join.joins.borrow().as_slice(), &[(7, 1, 8)]);
        // INIT/SIPI traffic never reached the pass-through sink.
        assert!(c.sink.writes.iter().all(|(off, _)| *off != reg::ICR_LO));

        ept.lock().release_frames();
    }

    #[test]
    fn plain_writes_pass_through_and_reads_answer_from_sink() {
        let ept = guest_tree(0xE2);
        let mut c = Controller::new(RecordingSink {
            read_answer: 0x1ff,
            ..Default::default()
        });
        let join = RecordingJoin::default();
        let mut sipi = SipiTracker::default();
        let mut gprs = GeneralPurposeRegisters::default();

        gprs.rax = 0;
        run_access(
            &ept,
            &mut c,
            &join,
            &mut sipi,
            &mov_to(0xfee0_00b0),
            write_access(reg::EOI),
            &mut gprs,
        );
        assert_eq!(c.sink.writes, vec![(reg::EOI, 0)]);

        gprs.rax = 0xdead_beef;
        run_access(
            &ept,
            &mut c,
            &join,
            &mut sipi,
            &mov_from(0xfee0_00f0),
            reg::SIV as u64 | (ACCESS_READ << ACCESS_TYPE_SHIFT),
            &mut gprs,
        );
        assert_eq!(gprs.rax, 0x1ff);

        ept.lock().release_frames();
    }
}
