//! VMX capability MSRs and execution-control bit tables.

/// MSR - IA32_VMX_BASIC.
pub const IA32_VMX_BASIC: usize = 0x480;
/// MSR - IA32_VMX_PINBASED_CTLS.
pub const IA32_VMX_PINBASED_CTLS: usize = 0x481;
/// MSR - IA32_VMX_PROC_BASED_CTLS.
pub const IA32_VMX_PROC_BASED_CTLS: usize = 0x482;
/// MSR - IA32_VMX_PROC_BASED_CTLS2.
pub const IA32_VMX_PROC_BASED_CTLS2: usize = 0x48B;
/// MSR - IA32_VMX_EXIT_CTLS.
pub const IA32_VMX_EXIT_CTLS: usize = 0x483;
/// MSR - IA32_VMX_ENTRY_CTLS.
pub const IA32_VMX_ENTRY_CTLS: usize = 0x484;
/// MSR - IA32_VMX_CR0_FIXED0.
pub const IA32_VMX_CR0_FIXED0: usize = 0x486;
/// MSR - IA32_VMX_CR0_FIXED1.
pub const IA32_VMX_CR0_FIXED1: usize = 0x487;
/// MSR - IA32_VMX_CR4_FIXED0.
pub const IA32_VMX_CR4_FIXED0: usize = 0x488;
/// MSR - IA32_VMX_CR4_FIXED1.
pub const IA32_VMX_CR4_FIXED1: usize = 0x489;
/// MSR - IA32_VMX_EPT_VPID_CAP.
pub const IA32_VMX_EPT_VPID_CAP: usize = 0x48C;

bitflags::bitflags! {
    /// Pin-based VM-execution controls.
    pub struct PinCtl: u32 {
        /// External interrupts cause VM exits regardless of RFLAGS.IF.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// NMIs cause VM exits.
        const NMI_EXITING = 1 << 3;
        /// NMIs are never blocked; interruptibility tracks virtual-NMI blocking.
        const VIRTUAL_NMIS = 1 << 5;
        /// The VMX-preemption timer counts down in non-root operation.
        const ACTIVE_VMX_PREEMPTION_TIMER = 1 << 6;
        /// Posted-interrupt processing.
        const PROCESS_POSTED_INTERRUPT = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Primary processor-based VM-execution controls.
    pub struct ProcCtl: u32 {
        /// VM exit at the start of any instruction while RFLAGS.IF = 1 and
        /// interrupts are not otherwise blocked.
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        /// Apply the TSC offset to RDTSC/RDTSCP/RDMSR of the TSC.
        const USE_TSC_OFFSETTING = 1 << 3;
        /// HLT causes VM exits.
        const HLT_EXITING = 1 << 7;
        /// INVLPG causes VM exits.
        const INVLPG_EXITING = 1 << 9;
        /// MWAIT causes VM exits.
        const MWAIT_EXITING = 1 << 10;
        /// RDPMC causes VM exits.
        const RDPMC_EXITING = 1 << 11;
        /// RDTSC/RDTSCP cause VM exits.
        const RDTSC_EXITING = 1 << 12;
        /// MOV to CR3 causes VM exits.
        const CR3_LOAD_EXITING = 1 << 15;
        /// MOV from CR3 causes VM exits.
        const CR3_STORE_EXITING = 1 << 16;
        /// MOV to CR8 causes VM exits.
        const CR8_LOAD_EXITING = 1 << 19;
        /// MOV from CR8 causes VM exits.
        const CR8_STORE_EXITING = 1 << 20;
        /// TPR virtualization through the virtual-APIC page.
        const USE_TPR_SHADOW = 1 << 21;
        /// VM exit at the start of any instruction with no virtual-NMI blocking.
        const NMI_WINDOW_EXITING = 1 << 22;
        /// MOV DR causes VM exits.
        const MOV_DR_EXITING = 1 << 23;
        /// All I/O instructions cause VM exits.
        const UNCONDITIONAL_IO_EXITING = 1 << 24;
        /// Restrict I/O exits through the I/O bitmaps.
        const USE_IO_BITMAPS = 1 << 25;
        /// Monitor trap flag.
        const MONITOR_TRAP_FLAG = 1 << 27;
        /// Restrict RDMSR/WRMSR exits through the MSR bitmaps.
        const USE_MSR_BITMAPS = 1 << 28;
        /// MONITOR causes VM exits.
        const MONITOR_EXITING = 1 << 29;
        /// PAUSE causes VM exits.
        const PAUSE_EXITING = 1 << 30;
        /// The secondary processor-based controls are in use.
        const ACTIVATE_SECONDARY_CTL = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Secondary processor-based VM-execution controls.
    pub struct ProcCtl2: u32 {
        /// Accesses to the APIC-access page are treated specially.
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        /// Extended page tables are enabled.
        const ENABLE_EPT = 1 << 1;
        /// Descriptor-table instructions cause VM exits.
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        /// RDTSCP does not #UD.
        const ENABLE_RDTSCP = 1 << 3;
        /// RDMSR/WRMSR to the x2APIC range are treated specially.
        const VIRTUALIZE_X2APIC_MODE = 1 << 4;
        /// Cached linear translations are tagged with a VPID.
        const ENABLE_VPID = 1 << 5;
        /// WBINVD causes VM exits.
        const WBINVD_EXITING = 1 << 6;
        /// The guest may run unpaged or in real-address mode.
        const UNRESTRICTED_GUEST = 1 << 7;
        /// APIC register virtualization.
        const APIC_REGISTER_VIRTUALIZATION = 1 << 8;
        /// Evaluation and delivery of pending virtual interrupts.
        const VIRTUAL_INTERRUPT_DELIVERY = 1 << 9;
        /// A series of PAUSEs can cause a VM exit.
        const PAUSE_LOOP_EXITING = 1 << 10;
        /// INVPCID does not #UD.
        const ENABLE_INVPCID = 1 << 12;
        /// VMREAD/VMWRITE in non-root operation may access a shadow VMCS.
        const VMCS_SHADOWING = 1 << 14;
        /// EPT accessed/dirty logging through the page-modification log.
        const ENABLE_PML = 1 << 17;
        /// EPT violations may raise #VE instead of exiting.
        const EPT_VIOLATION_VE = 1 << 18;
        /// XSAVES/XRSTORS do not #UD.
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
        /// EPT execute permissions split by supervisor/user linear address.
        const MODE_BASED_EXEC_CTL_FOR_EPT = 1 << 22;
    }
}

bitflags::bitflags! {
    /// VM-entry controls.
    pub struct EntryCtl: u32 {
        /// Load DR7 and IA32_DEBUGCTL on entry.
        const LOAD_DEBUG_CTLS = 1 << 2;
        /// The guest is in IA-32e mode after entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// Entry to system-management mode.
        const ENTRY_TO_SMM = 1 << 10;
        /// Default SMI/SMM treatment after entry.
        const DEACTIVATE_DUAL_MONITOR_TREATMENT = 1 << 11;
        /// Load IA32_PERF_GLOBAL_CTRL on entry.
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 13;
        /// Load IA32_PAT on entry.
        const LOAD_IA32_PAT = 1 << 14;
        /// Load IA32_EFER on entry.
        const LOAD_IA32_EFER = 1 << 15;
    }
}

bitflags::bitflags! {
    /// VM-exit controls.
    pub struct ExitCtl: u32 {
        /// Save DR7 and IA32_DEBUGCTL on exit.
        const SAVE_DEBUG_CTLS = 1 << 2;
        /// The processor is in 64-bit mode after exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        /// Load IA32_PERF_GLOBAL_CTRL on exit.
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 12;
        /// Acknowledge the interrupt controller on external-interrupt exits,
        /// storing the vector in the exit interruption-information field.
        const ACK_INTERRUPT_ON_EXIT = 1 << 15;
        /// Save IA32_PAT on exit.
        const SAVE_IA32_PAT = 1 << 18;
        /// Load IA32_PAT on exit.
        const LOAD_IA32_PAT = 1 << 19;
        /// Save IA32_EFER on exit.
        const SAVE_IA32_EFER = 1 << 20;
        /// Load IA32_EFER on exit.
        const LOAD_IA32_EFER = 1 << 21;
        /// Save the VMX-preemption timer on exit.
        const SAVE_VMX_PREEMPTION_TIMER_VALUE = 1 << 22;
    }
}

/// Pin-based controls every vproc starts from.
pub fn default_pin_ctls() -> PinCtl {
    PinCtl::EXTERNAL_INTERRUPT_EXITING | PinCtl::NMI_EXITING
}

/// Primary processor-based controls every vproc starts from.
pub fn default_proc_ctls() -> ProcCtl {
    ProcCtl::HLT_EXITING
        | ProcCtl::USE_MSR_BITMAPS
        | ProcCtl::USE_TPR_SHADOW
        | ProcCtl::ACTIVATE_SECONDARY_CTL
}

/// Secondary processor-based controls every vproc starts from.
pub fn default_proc_ctls2() -> ProcCtl2 {
    ProcCtl2::ENABLE_EPT
        | ProcCtl2::ENABLE_VPID
        | ProcCtl2::UNRESTRICTED_GUEST
        | ProcCtl2::VIRTUALIZE_APIC_ACCESSES
        | ProcCtl2::ENABLE_RDTSCP
}

/// VM-entry controls every vproc starts from.
pub fn default_entry_ctls() -> EntryCtl {
    EntryCtl::IA32E_MODE_GUEST | EntryCtl::LOAD_IA32_EFER
}

/// VM-exit controls every vproc starts from.
pub fn default_exit_ctls() -> ExitCtl {
    ExitCtl::HOST_ADDRESS_SPACE_SIZE
        | ExitCtl::ACK_INTERRUPT_ON_EXIT
        | ExitCtl::SAVE_IA32_EFER
        | ExitCtl::LOAD_IA32_EFER
}
