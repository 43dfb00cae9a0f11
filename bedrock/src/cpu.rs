//! Processor register state.

use core::arch::asm;

bitflags::bitflags! {
    /// RFLAGS register.
    pub struct Rflags: u64 {
        /// Carry flag.
        const CF = 1 << 0;
        /// Reserved, always 1.
        const _1 = 1 << 1;
        /// Parity flag.
        const PF = 1 << 2;
        /// Auxiliary carry flag.
        const AF = 1 << 4;
        /// Zero flag.
        const ZF = 1 << 6;
        /// Sign flag.
        const SF = 1 << 7;
        /// Trap flag.
        const TF = 1 << 8;
        /// Interrupt enable flag.
        const IF = 1 << 9;
        /// Direction flag.
        const DF = 1 << 10;
        /// Overflow flag.
        const OF = 1 << 11;
    }
}

bitflags::bitflags! {
    /// CR0 control register.
    pub struct Cr0: u64 {
        /// Protected mode enable.
        const PE = 1 << 0;
        /// Monitor co-processor.
        const MP = 1 << 1;
        /// x87 emulation.
        const EM = 1 << 2;
        /// Task switched.
        const TS = 1 << 3;
        /// Numeric error.
        const NE = 1 << 5;
        /// Write protect.
        const WP = 1 << 16;
        /// Not-write through.
        const NW = 1 << 29;
        /// Cache disable.
        const CD = 1 << 30;
        /// Paging enable.
        const PG = 1 << 31;
    }
}

bitflags::bitflags! {
    /// CR4 control register.
    pub struct Cr4: u64 {
        /// Physical address extension.
        const PAE = 1 << 5;
        /// Machine-check exception enable.
        const MCE = 1 << 6;
        /// Page global enable.
        const PGE = 1 << 7;
        /// OS fxsave/fxrstor support.
        const OSFXSR = 1 << 9;
        /// OS unmasked SIMD exception support.
        const OSXMMEXCPT = 1 << 10;
        /// VMX enable.
        const VMXE = 1 << 13;
        /// XSAVE enable.
        const OSXSAVE = 1 << 18;
    }
}

impl Cr0 {
    /// Read the current CR0.
    pub fn current() -> Self {
        let v: u64;
        unsafe {
            asm!("mov {}, cr0", out(reg) v, options(nomem, nostack));
        }
        Self::from_bits_truncate(v)
    }
}

impl Cr4 {
    /// Read the current CR4.
    pub fn current() -> Self {
        let v: u64;
        unsafe {
            asm!("mov {}, cr4", out(reg) v, options(nomem, nostack));
        }
        Self::from_bits_truncate(v)
    }

    /// Replace the current CR4.
    ///
    /// # Safety
    /// Changes processor operating mode.
    pub unsafe fn apply(self) {
        asm!("mov cr4, {}", in(reg) self.bits(), options(nomem, nostack));
    }
}

/// Guest general-purpose register block.
///
/// The field order is the save/restore order of the VM-entry and VM-exit
/// assembly stubs; the trailing slot carries the guest CR2, which hardware
/// does not context-switch for us.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct GeneralPurposeRegisters {
    pub r15: usize,
    pub r14: usize,
    pub r13: usize,
    pub r12: usize,
    pub r11: usize,
    pub r10: usize,
    pub r9: usize,
    pub r8: usize,
    pub rsi: usize,
    pub rdi: usize,
    pub rbp: usize,
    pub rdx: usize,
    pub rcx: usize,
    pub rbx: usize,
    pub rax: usize,
    pub cr2: usize,
}

/// 512-byte FXSAVE area holding the guest SSE/x87 state.
#[repr(C, align(16))]
pub struct FxArea(pub [u8; 512]);

impl Default for FxArea {
    fn default() -> Self {
        Self([0; 512])
    }
}

impl FxArea {
    /// Save the current extended register state into this area.
    ///
    /// # Safety
    /// Requires CR4.OSFXSR.
    #[inline]
    pub unsafe fn save(&mut self) {
        asm!("fxsave64 [{}]", in(reg) self.0.as_mut_ptr(), options(nostack));
    }

    /// Restore the extended register state from this area.
    ///
    /// # Safety
    /// The area must hold a state produced by [`FxArea::save`].
    #[inline]
    pub unsafe fn restore(&self) {
        asm!("fxrstor64 [{}]", in(reg) self.0.as_ptr(), options(nostack));
    }
}

/// Read the current CS selector.
#[inline]
pub fn read_cs() -> u16 {
    let v: u16;
    unsafe {
        asm!("mov {:x}, cs", out(reg) v, options(nomem, nostack));
    }
    v
}

/// Read the current SS selector.
#[inline]
pub fn read_ss() -> u16 {
    let v: u16;
    unsafe {
        asm!("mov {:x}, ss", out(reg) v, options(nomem, nostack));
    }
    v
}

/// Read the current TR selector.
#[inline]
pub fn read_tr() -> u16 {
    let v: u16;
    unsafe {
        asm!("str {:x}", out(reg) v, options(nomem, nostack));
    }
    v
}

/// Base and limit pair reported by `sgdt`/`sidt`.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct DescriptorTable {
    pub limit: u16,
    pub base: u64,
}

/// Read the current GDTR.
#[inline]
pub fn sgdt() -> DescriptorTable {
    let mut dt = DescriptorTable { limit: 0, base: 0 };
    unsafe {
        asm!("sgdt [{}]", in(reg) &mut dt, options(nostack));
    }
    dt
}

/// Read the current IDTR.
#[inline]
pub fn sidt() -> DescriptorTable {
    let mut dt = DescriptorTable { limit: 0, base: 0 };
    unsafe {
        asm!("sidt [{}]", in(reg) &mut dt, options(nostack));
    }
    dt
}
