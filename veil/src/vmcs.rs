//! Virtual-machine control structure (VMCS) access.
//!
//! One hardware VMCS region backs one vproc. Field mutation during normal
//! operation goes through the in-memory snapshot (`crate::snapshot`); this
//! module is the thin layer that talks to the region itself: VMXON/
//! VMCLEAR/VMPTRLD/VMPTRST, raw VMREAD/VMWRITE on the currently loaded
//! region, and the decoding of exit information into a [`TrapEvent`].

use crate::vm::Gpa;
use crate::vm_control::IA32_VMX_BASIC;
use crate::VmError;
use bedrock::addressing::{Pa, Va};
use bedrock::msr::Msr;
use core::arch::asm;

/// A hardware VMCS region.
#[repr(align(4096))]
pub struct Vmcs {
    /// Bits 30:0: revision identifier, bit 31: shadow-VMCS indicator.
    rev_id: u32,
    /// VMX-abort indicator.
    indicator: u32,
    /// Implementation-specific data.
    _data: [u8; 0x1000 - 8],
}

impl Vmcs {
    /// Create a region stamped with the processor's revision identifier.
    pub fn new() -> Self {
        let vmx_basic = Msr::<IA32_VMX_BASIC>::read();
        Self {
            rev_id: vmx_basic as u32 & 0x7fff_ffff,
            indicator: 0,
            _data: [0; 0x1000 - 8],
        }
    }

    /// Host-physical address of this region.
    pub fn pa(&self) -> Pa {
        Va::new(self as *const _ as usize).unwrap().into_pa()
    }

    /// Execute VMXON with this region.
    pub(crate) fn on(&self) -> Result<(), InstructionError> {
        unsafe {
            let err: i8;
            let pa = self.pa().into_usize();
            asm!(
                "clc",
                "vmxon [{}]",
                "setna {}",
                in(reg) &pa,
                out(reg_byte) err
            );
            if err != 0 {
                Err(Self::instruction_error())
            } else {
                Ok(())
            }
        }
    }

    /// Execute VMCLEAR on this region.
    pub fn clear(&self) -> Result<(), VmError> {
        unsafe {
            let err: i8;
            let pa = self.pa().into_usize();
            asm!(
                "clc",
                "vmclear [{}]",
                "setna {}",
                in(reg) &pa,
                out(reg_byte) err
            );
            if err != 0 {
                Err(VmError::VmxOperationError(Self::instruction_error()))
            } else {
                Ok(())
            }
        }
    }

    /// Make this region the working VMCS of the core.
    pub fn activate(&self) -> Result<ActiveVmcs, VmError> {
        unsafe {
            let err: i8;
            let pa = self.pa().into_usize();
            asm!(
                "clc",
                "vmptrld [{}]",
                "setna {}",
                in(reg) &pa,
                out(reg_byte) err
            );
            if err != 0 {
                Err(VmError::VmxOperationError(Self::instruction_error()))
            } else {
                Ok(ActiveVmcs { _p: () })
            }
        }
    }

    pub(crate) fn instruction_error() -> InstructionError {
        unsafe {
            let err: i8;
            let v: u64;
            asm!(
                "clc",
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) Field::InstructionError as u64,
                out(reg_byte) err
            );
            if err != 0 {
                InstructionError::Unknown
            } else {
                InstructionError::from_raw(v)
            }
        }
    }
}

/// VM-instruction error numbers the processor reports after a failed VMX
/// instruction.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum InstructionError {
    /// VMCALL executed in VMX root operation.
    VmcallInVmxRoot,
    /// VMCLEAR with invalid physical address.
    VmclearWithInvAddr,
    /// VMCLEAR with the VMXON pointer.
    VmclearWithVmxon,
    /// VMLAUNCH with non-clear VMCS.
    VmlaunchWithNonclearVmcs,
    /// VMRESUME with non-launched VMCS.
    VmresumeWithNonlaunchedVmcs,
    /// VMRESUME after VMXOFF.
    VmresumeAfterVmxoff,
    /// VM entry with invalid control fields.
    InvalidControlFields,
    /// VM entry with invalid host-state fields.
    InvalidHostState,
    /// VMPTRLD with invalid physical address.
    VmptrldWithInvAddr,
    /// VMPTRLD with the VMXON pointer.
    VmptrldWithVmxon,
    /// VMPTRLD with incorrect VMCS revision identifier.
    VmptrldWithIncorrectRevId,
    /// VMREAD/VMWRITE to an unsupported component.
    UnsupportedVmcsField,
    /// VMWRITE to a read-only component.
    WriteToRoField,
    /// VMXON executed in VMX root operation.
    VmxonInVmxRoot,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidOperandToInveptInvvpid,
    /// Anything the table above does not name.
    Unknown,
}

impl InstructionError {
    fn from_raw(v: u64) -> Self {
        match v {
            1 => Self::VmcallInVmxRoot,
            2 => Self::VmclearWithInvAddr,
            3 => Self::VmclearWithVmxon,
            4 => Self::VmlaunchWithNonclearVmcs,
            5 => Self::VmresumeWithNonlaunchedVmcs,
            6 => Self::VmresumeAfterVmxoff,
            7 => Self::InvalidControlFields,
            8 => Self::InvalidHostState,
            9 => Self::VmptrldWithInvAddr,
            10 => Self::VmptrldWithVmxon,
            11 => Self::VmptrldWithIncorrectRevId,
            12 => Self::UnsupportedVmcsField,
            13 => Self::WriteToRoField,
            15 => Self::VmxonInVmxRoot,
            28 => Self::InvalidOperandToInveptInvvpid,
            _ => Self::Unknown,
        }
    }
}

/// VMCS field encodings.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    // 16-bit control fields.
    Vpid = 0x0000_0000,
    // 16-bit guest-state fields.
    GuestEsSelector = 0x0000_0800,
    GuestCsSelector = 0x0000_0802,
    GuestSsSelector = 0x0000_0804,
    GuestDsSelector = 0x0000_0806,
    GuestFsSelector = 0x0000_0808,
    GuestGsSelector = 0x0000_080A,
    GuestLdtrSelector = 0x0000_080C,
    GuestTrSelector = 0x0000_080E,
    // 16-bit host-state fields.
    HostEsSelector = 0x0000_0C00,
    HostCsSelector = 0x0000_0C02,
    HostSsSelector = 0x0000_0C04,
    HostDsSelector = 0x0000_0C06,
    HostFsSelector = 0x0000_0C08,
    HostGsSelector = 0x0000_0C0A,
    HostTrSelector = 0x0000_0C0C,
    // 64-bit control fields.
    IoBitmapA = 0x0000_2000,
    IoBitmapB = 0x0000_2002,
    MsrBitmaps = 0x0000_2004,
    TscOffset = 0x0000_2010,
    VirtualApicPageAddr = 0x0000_2012,
    ApicAccessAddr = 0x0000_2014,
    Eptptr = 0x0000_201A,
    // 64-bit read-only data fields.
    GuestPhysicalAddr = 0x0000_2400,
    // 64-bit guest-state fields.
    GuestLinkPointer = 0x0000_2800,
    GuestIa32Debugctl = 0x0000_2802,
    GuestIa32Pat = 0x0000_2804,
    GuestIa32Efer = 0x0000_2806,
    // 64-bit host-state fields.
    HostIa32Pat = 0x0000_2C00,
    HostIa32Efer = 0x0000_2C02,
    // 32-bit control fields.
    PinBasedControls = 0x0000_4000,
    ProcBasedControls = 0x0000_4002,
    ExceptionBitmap = 0x0000_4004,
    PageFaultErrCodeMask = 0x0000_4006,
    PageFaultErrCodeMatch = 0x0000_4008,
    Cr3TargetCount = 0x0000_400A,
    VmexitControls = 0x0000_400C,
    VmexitMsrStoreCount = 0x0000_400E,
    VmexitMsrLoadCount = 0x0000_4010,
    VmentryControls = 0x0000_4012,
    VmentryMsrLoadCount = 0x0000_4014,
    VmentryInterruptionInfo = 0x0000_4016,
    VmentryExceptionErrCode = 0x0000_4018,
    VmentryInstructionLength = 0x0000_401A,
    TprThreshold = 0x0000_401C,
    SecondaryControls = 0x0000_401E,
    // 32-bit read-only data fields.
    InstructionError = 0x0000_4400,
    VmexitReason = 0x0000_4402,
    VmexitInterruptionInfo = 0x0000_4404,
    VmexitInterruptionErrCode = 0x0000_4406,
    IdtVectoringInfo = 0x0000_4408,
    IdtVectoringErrCode = 0x0000_440A,
    VmexitInstructionLength = 0x0000_440C,
    VmexitInstructionInfo = 0x0000_440E,
    // 32-bit guest-state fields.
    GuestEsLimit = 0x0000_4800,
    GuestCsLimit = 0x0000_4802,
    GuestSsLimit = 0x0000_4804,
    GuestDsLimit = 0x0000_4806,
    GuestFsLimit = 0x0000_4808,
    GuestGsLimit = 0x0000_480A,
    GuestLdtrLimit = 0x0000_480C,
    GuestTrLimit = 0x0000_480E,
    GuestGdtrLimit = 0x0000_4810,
    GuestIdtrLimit = 0x0000_4812,
    GuestEsAccessRights = 0x0000_4814,
    GuestCsAccessRights = 0x0000_4816,
    GuestSsAccessRights = 0x0000_4818,
    GuestDsAccessRights = 0x0000_481A,
    GuestFsAccessRights = 0x0000_481C,
    GuestGsAccessRights = 0x0000_481E,
    GuestLdtrAccessRights = 0x0000_4820,
    GuestTrAccessRights = 0x0000_4822,
    GuestInterruptibilityState = 0x0000_4824,
    GuestActivityState = 0x0000_4826,
    GuestPreemptionTimerValue = 0x0000_482E,
    // 32-bit host-state fields.
    HostIa32SysenterCs = 0x0000_4C00,
    // Natural-width control fields.
    Cr0GuestHostMask = 0x0000_6000,
    Cr4GuestHostMask = 0x0000_6002,
    Cr0ReadShadow = 0x0000_6004,
    Cr4ReadShadow = 0x0000_6006,
    // Natural-width read-only data fields.
    VmexitQualification = 0x0000_6400,
    GuestLinearAddr = 0x0000_640A,
    // Natural-width guest-state fields.
    GuestCr0 = 0x0000_6800,
    GuestCr3 = 0x0000_6802,
    GuestCr4 = 0x0000_6804,
    GuestEsBase = 0x0000_6806,
    GuestCsBase = 0x0000_6808,
    GuestSsBase = 0x0000_680A,
    GuestDsBase = 0x0000_680C,
    GuestFsBase = 0x0000_680E,
    GuestGsBase = 0x0000_6810,
    GuestLdtrBase = 0x0000_6812,
    GuestTrBase = 0x0000_6814,
    GuestGdtrBase = 0x0000_6816,
    GuestIdtrBase = 0x0000_6818,
    GuestDr7 = 0x0000_681A,
    GuestRsp = 0x0000_681C,
    GuestRip = 0x0000_681E,
    GuestRflags = 0x0000_6820,
    GuestPendingDbgExceptions = 0x0000_6822,
    // Natural-width host-state fields.
    HostCr0 = 0x0000_6C00,
    HostCr3 = 0x0000_6C02,
    HostCr4 = 0x0000_6C04,
    HostFsBase = 0x0000_6C06,
    HostGsBase = 0x0000_6C08,
    HostTrBase = 0x0000_6C0A,
    HostGdtrBase = 0x0000_6C0C,
    HostIdtrBase = 0x0000_6C0E,
    HostRsp = 0x0000_6C14,
    HostRip = 0x0000_6C16,
}

impl Field {
    /// Recover a field from its raw encoding, for the encodings the
    /// snapshot mirrors.
    pub fn from_encoding(encoding: u32) -> Option<Self> {
        Some(match encoding {
            0x0000_0000 => Field::Vpid,
            0x0000_201A => Field::Eptptr,
            0x0000_4004 => Field::ExceptionBitmap,
            0x0000_4016 => Field::VmentryInterruptionInfo,
            0x0000_6800 => Field::GuestCr0,
            0x0000_6802 => Field::GuestCr3,
            0x0000_6804 => Field::GuestCr4,
            0x0000_2806 => Field::GuestIa32Efer,
            0x0000_681A => Field::GuestDr7,
            0x0000_681C => Field::GuestRsp,
            0x0000_681E => Field::GuestRip,
            0x0000_6820 => Field::GuestRflags,
            0x0000_4824 => Field::GuestInterruptibilityState,
            0x0000_4826 => Field::GuestActivityState,
            _ => return None,
        })
    }
}

/// The VMCS the hardware is currently pointed at.
pub struct ActiveVmcs {
    _p: (),
}

impl ActiveVmcs {
    /// Point the hardware at the VMCS region at `pa`.
    ///
    /// # Safety
    /// `pa` must hold a VMCS region stamped with the processor's revision
    /// identifier.
    pub unsafe fn activate_pa(pa: Pa) -> Result<ActiveVmcs, VmError> {
        let err: i8;
        let raw = pa.into_usize();
        asm!(
            "clc",
            "vmptrld [{}]",
            "setna {}",
            in(reg) &raw,
            out(reg_byte) err
        );
        if err != 0 {
            Err(VmError::VmxOperationError(Vmcs::instruction_error()))
        } else {
            Ok(ActiveVmcs { _p: () })
        }
    }

    /// Write a field of the working VMCS by raw encoding.
    pub fn write_raw(&self, encoding: u32, v: u64) -> Result<(), VmError> {
        unsafe {
            let err: i8;
            asm!(
                "clc",
                "vmwrite {}, {}",
                "setna {}",
                in(reg) encoding as u64,
                in(reg) v,
                out(reg_byte) err
            );
            if err != 0 {
                Err(VmError::VmxOperationError(Vmcs::instruction_error()))
            } else {
                Ok(())
            }
        }
    }
    /// Read back the host-physical address of the working VMCS (VMPTRST).
    ///
    /// # Safety
    /// The caller must know a VMCS is loaded on this core.
    pub unsafe fn current() -> Result<(ActiveVmcs, Pa), VmError> {
        let err: i8;
        let mut out: usize = 0;
        let ptr: *mut usize = &mut out;
        asm!(
            "clc",
            "vmptrst [{}]",
            "setna {}",
            in(reg) ptr,
            out(reg_byte) err,
        );
        if err != 0 {
            Err(VmError::VmxOperationError(Vmcs::instruction_error()))
        } else {
            Ok((ActiveVmcs { _p: () }, Pa::new(out).unwrap()))
        }
    }

    /// Write a field of the working VMCS.
    pub fn write(&self, field: Field, v: u64) -> Result<(), VmError> {
        unsafe {
            let err: i8;
            asm!(
                "clc",
                "vmwrite {}, {}",
                "setna {}",
                in(reg) field as u64,
                in(reg) v,
                out(reg_byte) err
            );
            if err != 0 {
                Err(VmError::VmxOperationError(Vmcs::instruction_error()))
            } else {
                Ok(())
            }
        }
    }

    /// Read a field of the working VMCS.
    pub fn read(&self, field: Field) -> Result<u64, VmError> {
        unsafe {
            let err: i8;
            let v: u64;
            asm!(
                "clc",
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) field as u64,
                out(reg_byte) err
            );
            if err != 0 {
                Err(VmError::VmxOperationError(Vmcs::instruction_error()))
            } else {
                Ok(v)
            }
        }
    }

    /// Gather everything the dispatcher needs about the pending exit.
    pub fn trap_event(&self) -> Result<TrapEvent, VmError> {
        let raw_reason = self.read(Field::VmexitReason)?;
        let basic = BasicExitReason::parse(self, raw_reason & 0xffff)?;
        let reason = if raw_reason & 0x2000_0000 != 0 {
            ExitReason::ExitFromVmxRootOperation(basic)
        } else if raw_reason & 0x8000_0000 != 0 {
            ExitReason::EntryFailure(basic)
        } else {
            ExitReason::Basic(basic)
        };
        Ok(TrapEvent {
            reason,
            qualification: self.read(Field::VmexitQualification)?,
            guest_linear: self.read(Field::GuestLinearAddr)?,
            instruction_length: self.read(Field::VmexitInstructionLength)?,
            interruption_info: self.read(Field::VmexitInterruptionInfo)? as u32,
            idt_vectoring_info: self.read(Field::IdtVectoringInfo)? as u32,
        })
    }
}

/// Everything hardware reports about one VM exit, read once at dispatch
/// entry so handlers never touch the VMCS for exit data.
#[derive(Debug, Clone, Copy)]
pub struct TrapEvent {
    /// The decoded exit reason.
    pub reason: ExitReason,
    /// Exit qualification.
    pub qualification: u64,
    /// Guest-linear address, when the exit supplies one.
    pub guest_linear: u64,
    /// Length of the trapping instruction.
    pub instruction_length: u64,
    /// VM-exit interruption information.
    pub interruption_info: u32,
    /// IDT-vectoring information.
    pub idt_vectoring_info: u32,
}

impl TrapEvent {
    /// Fabricate an event, for exercising handlers without hardware.
    pub fn synthetic(reason: BasicExitReason, qualification: u64, instruction_length: u64) -> Self {
        TrapEvent {
            reason: ExitReason::Basic(reason),
            qualification,
            guest_linear: 0,
            instruction_length,
            interruption_info: 0,
            idt_vectoring_info: 0,
        }
    }

    /// The basic reason regardless of entry-failure wrapping.
    pub fn basic_reason(&self) -> &BasicExitReason {
        self.reason.basic()
    }
}

/// Interruption type of a vectored exit.
#[derive(Debug, Clone, Copy)]
pub enum InterruptionType {
    /// External interrupt.
    ExternalInt,
    /// Non-maskable interrupt.
    Nmi,
    /// Hardware exception.
    HardwareException,
    /// Privileged software exception.
    PrivSoftwareException,
    /// Software exception.
    SoftwareException,
}

/// VM-exit interruption information, valid bit already checked.
#[derive(Debug, Clone, Copy)]
pub struct ExternalIntInfo {
    /// Vector of the interrupt or exception.
    pub vector: u8,
    /// Interruption type.
    pub interruption_type: InterruptionType,
    /// An error code was pushed.
    pub error_code_valid: bool,
}

/// Basic VM-exit reasons.
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub enum BasicExitReason {
    ExceptionOrNmi,
    ExternalInt(Option<ExternalIntInfo>),
    TripleFault,
    InitSignal,
    StartupIpi,
    InterruptWindow,
    TaskSwitch,
    Cpuid,
    Hlt,
    Invd,
    Invlpg,
    Rdpmc,
    Rdtsc,
    Vmcall,
    Vmclear,
    Vmlaunch,
    Vmptrld,
    Vmptrst,
    Vmread,
    Vmresume,
    Vmwrite,
    Vmxoff,
    Vmxon,
    MovCr,
    MovDr,
    IoInstruction,
    Rdmsr,
    Wrmsr,
    EntryFailGuestState,
    EntryFailMsrLoading,
    Mwait,
    Monitor,
    Pause,
    TprBelowThreshold,
    ApicAccess,
    EptViolation {
        qualification: EptViolationQualification,
        fault_addr: Option<Gpa>,
    },
    EptMisconfig,
    Invept,
    Rdtscp,
    VmxPreemptTimer,
    Invvpid,
    Wbinvd,
    Xsetbv,
    Unknown(u64),
}

impl BasicExitReason {
    fn parse(vmcs: &ActiveVmcs, reason: u64) -> Result<Self, VmError> {
        Ok(match reason {
            0x0 => Self::ExceptionOrNmi,
            0x1 => {
                let info = vmcs.read(Field::VmexitInterruptionInfo)? as u32;
                Self::ExternalInt(if info & 0x8000_0000 != 0 {
                    Some(ExternalIntInfo {
                        vector: info as u8,
                        interruption_type: match (info >> 8) & 7 {
                            0 => InterruptionType::ExternalInt,
                            2 => InterruptionType::Nmi,
                            3 => InterruptionType::HardwareException,
                            5 => InterruptionType::PrivSoftwareException,
                            6 => InterruptionType::SoftwareException,
                            _ => unreachable!(),
                        },
                        error_code_valid: info & (1 << 11) != 0,
                    })
                } else {
                    None
                })
            }
            0x2 => Self::TripleFault,
            0x3 => Self::InitSignal,
            0x4 => Self::StartupIpi,
            0x7 => Self::InterruptWindow,
            0x9 => Self::TaskSwitch,
            0xA => Self::Cpuid,
            0xC => Self::Hlt,
            0xD => Self::Invd,
            0xE => Self::Invlpg,
            0xF => Self::Rdpmc,
            0x10 => Self::Rdtsc,
            0x12 => Self::Vmcall,
            0x13 => Self::Vmclear,
            0x14 => Self::Vmlaunch,
            0x15 => Self::Vmptrld,
            0x16 => Self::Vmptrst,
            0x17 => Self::Vmread,
            0x18 => Self::Vmresume,
            0x19 => Self::Vmwrite,
            0x1A => Self::Vmxoff,
            0x1B => Self::Vmxon,
            0x1C => Self::MovCr,
            0x1D => Self::MovDr,
            0x1E => Self::IoInstruction,
            0x1F => Self::Rdmsr,
            0x20 => Self::Wrmsr,
            0x21 => Self::EntryFailGuestState,
            0x22 => Self::EntryFailMsrLoading,
            0x24 => Self::Mwait,
            0x27 => Self::Monitor,
            0x28 => Self::Pause,
            0x2B => Self::TprBelowThreshold,
            0x2C => Self::ApicAccess,
            0x30 => Self::EptViolation {
                qualification: EptViolationQualification::from_bits_truncate(
                    vmcs.read(Field::VmexitQualification)?,
                ),
                fault_addr: Gpa::new(vmcs.read(Field::GuestPhysicalAddr)? as usize),
            },
            0x31 => Self::EptMisconfig,
            0x32 => Self::Invept,
            0x33 => Self::Rdtscp,
            0x34 => Self::VmxPreemptTimer,
            0x35 => Self::Invvpid,
            0x36 => Self::Wbinvd,
            0x37 => Self::Xsetbv,
            v => Self::Unknown(v),
        })
    }
}

bitflags::bitflags! {
    /// Exit qualification for EPT violations.
    pub struct EptViolationQualification: u64 {
        /// The access was a data read.
        const READ = 1 << 0;
        /// The access was a data write.
        const WRITE = 1 << 1;
        /// The access was an instruction fetch.
        const FETCH = 1 << 2;
        /// The guest-physical address was readable.
        const GPA_READABLE = 1 << 3;
        /// The guest-physical address was writable.
        const GPA_WRITABLE = 1 << 4;
        /// The guest-physical address was executable.
        const GPA_EXECUTABLE = 1 << 5;
        /// The guest linear-address field is valid.
        const LINEAR_VALID = 1 << 7;
        /// The access translated a linear address (clear: page walk or
        /// accessed/dirty update).
        const TO_TRANSLATION = 1 << 8;
        /// NMI unblocking due to IRET.
        const NMI_UNBLOCKED_BY_IRET = 1 << 12;
    }
}

/// Exit reason with its entry-failure / root-operation wrapping.
#[derive(Debug, Clone, Copy)]
pub enum ExitReason {
    /// Exit during non-root execution.
    Basic(BasicExitReason),
    /// Failed on VMLAUNCH or VMRESUME.
    EntryFailure(BasicExitReason),
    /// Exit incident to VMX root operation.
    ExitFromVmxRootOperation(BasicExitReason),
}

impl ExitReason {
    /// Get the basic exit reason of this reason.
    pub fn basic(&self) -> &BasicExitReason {
        match self {
            Self::Basic(e) | Self::EntryFailure(e) | Self::ExitFromVmxRootOperation(e) => e,
        }
    }
}
