//! Local Advanced Programmable Interrupt Controller (APIC) driver.
//!
//! This drives the local APIC through its memory-mapped register window.
//! Inter-processor interrupts go through the interrupt command register
//! (ICR); every send spins on the ICR delivery-status bit until the
//! previous IPI has been accepted, which is the one deliberate busy-wait
//! in the hypervisor.

use crate::addressing::{Pa, Va};
use crate::intrinsics::cpu_relax;
use crate::msr::{Msr, IA32_APIC_BASE};

/// Architectural default base of the local-APIC register window.
pub const APIC_DEFAULT_BASE: usize = 0xFEE0_0000;
/// Architectural base of the I/O APIC register window.
pub const IOAPIC_BASE: usize = 0xFEC0_0000;

/// Local APIC register offsets.
pub mod reg {
    /// Local APIC id.
    pub const ID: usize = 0x020;
    /// End of interrupt.
    pub const EOI: usize = 0x0B0;
    /// Spurious interrupt vector.
    pub const SIV: usize = 0x0F0;
    /// Interrupt command register, low half.
    pub const ICR_LO: usize = 0x300;
    /// Interrupt command register, high half (destination).
    pub const ICR_HI: usize = 0x310;
}

/// ICR delivery mode: INIT.
pub const ICR_INIT: u32 = 0x500;
/// ICR delivery mode: start-up IPI.
pub const ICR_STARTUP: u32 = 0x600;
/// ICR level assert.
pub const ICR_ASSERT: u32 = 0x4000;
/// ICR delivery-status bit; set while an IPI is in flight.
pub const ICR_BUSY: u32 = 0x1000;

/// The local APIC of the running core.
pub struct LocalApic {
    regs: Va,
}

impl LocalApic {
    /// Open the local APIC at the base programmed in IA32_APIC_BASE.
    ///
    /// # Safety
    /// The APIC window must be mapped uncached in the linear map.
    pub unsafe fn current() -> Self {
        let base = (Msr::<IA32_APIC_BASE>::read() as usize) & !0xfff;
        Self {
            regs: Pa::new(base).unwrap().into_va(),
        }
    }

    /// Read an APIC register.
    #[inline]
    pub fn read(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.regs + offset).into_usize() as *const u32) }
    }

    /// Write an APIC register.
    ///
    /// # Safety
    /// Register writes change interrupt routing for the whole core.
    #[inline]
    pub unsafe fn write(&self, offset: usize, v: u32) {
        core::ptr::write_volatile((self.regs + offset).into_usize() as *mut u32, v);
    }

    /// Signal end-of-interrupt.
    pub fn eoi(&self) {
        unsafe { self.write(reg::EOI, 0) };
    }

    fn wait_delivery(&self) {
        while self.read(reg::ICR_LO) & ICR_BUSY != 0 {
            cpu_relax();
        }
    }

    /// Send an IPI with the raw ICR low word `icr` to `apic_id`, then spin
    /// until the delivery-status bit clears.
    ///
    /// # Safety
    /// Interrupts the destination core.
    pub unsafe fn send_ipi(&self, apic_id: u8, icr: u32) {
        self.write(reg::ICR_HI, (apic_id as u32) << 24);
        self.write(reg::ICR_LO, icr | ICR_ASSERT);
        self.wait_delivery();
    }

    /// Bring up `apic_id` with the standard INIT followed by two start-up
    /// IPIs pointing at the 4 KiB-aligned real-mode entry `entry`.
    ///
    /// # Safety
    /// The destination core starts executing at `entry` in real mode.
    pub unsafe fn start_core(&self, apic_id: u8, entry: Pa) {
        let vector = (entry.into_usize() >> 12) as u32 & 0xff;
        self.send_ipi(apic_id, ICR_INIT);
        self.send_ipi(apic_id, ICR_STARTUP | vector);
        self.send_ipi(apic_id, ICR_STARTUP | vector);
    }
}
