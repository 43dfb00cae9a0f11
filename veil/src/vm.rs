//! Vproc lifecycle and lookup.
//!
//! [`HvContext`] is the explicit context object the dispatcher and the
//! lifecycle operate through: the id and VMCS-address lookup tables, the
//! global hypervisor entry lock a joining core must take before running a
//! vproc, and the SMP join slot carrying the bring-up request between
//! cores. It is constructed once at boot and passed around; there are no
//! implicit statics behind it.

use crate::acpi::FirmwareTables;
use crate::snapshot::{HostState, VmcsSnapshot};
use crate::space::{GuestSpace, GDT_BASE};
use crate::vcpu::{vmexit_entry_addr, Vproc, VprocId};
use crate::vmcs::{ActiveVmcs, Vmcs};
use crate::vmexits::SmpJoin;
use crate::{BootPhase, VmError};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use bedrock::addressing::Pa;
use bedrock::mm::Page;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex as SpinLock;

/// Guest virtual address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gva(usize);

impl Gva {
    /// Create a new canonical guest-virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast into usize.
    #[inline]
    pub const unsafe fn into_usize(self) -> usize {
        self.0
    }
}

/// Guest physical address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gpa(usize);

impl Gpa {
    /// Create a new guest-physical address with a check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const unsafe fn into_usize(self) -> usize {
        self.0
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Gva);
impl_arith!(Gpa);

impl core::fmt::Debug for Gva {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gva(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

/// A multi-core bring-up request parked for the joining core.
#[derive(Debug, Clone, Copy)]
pub struct JoinRequest {
    /// The vproc the joining core must attach to.
    pub vproc: VprocId,
    /// Start-up vector (page number) the joined core begins at.
    pub entry_vector: u8,
}

/// Sizing of a new guest.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Bytes of plain guest RAM.
    pub ram_bytes: usize,
    /// Initial guest stack pointer.
    pub stack: u64,
}

/// Process-wide hypervisor state, constructed once at boot.
pub struct HvContext {
    vprocs: SpinLock<BTreeMap<VprocId, Arc<SpinLock<Vproc>>>>,
    by_vmcs: SpinLock<BTreeMap<usize, VprocId>>,
    next_id: AtomicU32,
    /// The global hypervisor lock; a core takes it before any vproc runs
    /// on it.
    pub entry_lock: SpinLock<()>,
    join_target: SpinLock<Option<JoinRequest>>,
}

impl HvContext {
    /// Fresh context; vproc identifiers start at 1, 0 stays reserved.
    pub fn new() -> Self {
        Self {
            vprocs: SpinLock::new(BTreeMap::new()),
            by_vmcs: SpinLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            entry_lock: SpinLock::new(()),
            join_target: SpinLock::new(None),
        }
    }

    /// Claim the next vproc identifier.
    pub fn allocate_id(&self) -> VprocId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register an assembled vproc under both lookup keys.
    pub fn insert(&self, vproc: Vproc) -> Arc<SpinLock<Vproc>> {
        let id = vproc.id;
        let pa = unsafe { vproc.vmcs_pa().into_usize() };
        let arc = Arc::new(SpinLock::new(vproc));
        self.vprocs.lock().insert(id, arc.clone());
        self.by_vmcs.lock().insert(pa, id);
        arc
    }

    /// Look a vproc up by identifier.
    pub fn get(&self, id: VprocId) -> Option<Arc<SpinLock<Vproc>>> {
        self.vprocs.lock().get(&id).cloned()
    }

    /// Resolve the vproc owning the VMCS region at `pa`: the primary
    /// region, or the shadow region of a nested-engaged vproc.
    pub fn get_by_vmcs(&self, pa: Pa) -> Option<Arc<SpinLock<Vproc>>> {
        let raw = unsafe { pa.into_usize() };
        if let Some(id) = self.by_vmcs.lock().get(&raw).copied() {
            return self.get(id);
        }
        self.vprocs
            .lock()
            .values()
            .find(|v| {
                v.lock()
                    .shadow
                    .as_ref()
                    .map(|s| s.region_pa() == pa)
                    .unwrap_or(false)
            })
            .cloned()
    }

    /// Resolve the vproc whose VMCS the hardware is currently pointed at.
    ///
    /// # Safety
    /// A VMCS must be loaded on this core.
    pub unsafe fn resolve_current(&self) -> Result<Arc<SpinLock<Vproc>>, VmError> {
        let (_, pa) = ActiveVmcs::current()?;
        self.get_by_vmcs(pa)
            .ok_or(VmError::ControllerError(Box::new("no vproc for loaded VMCS")))
    }

    /// Build a runnable guest: fresh identifier, address space (RAM,
    /// kernel image, RAM-disk, relocated ACPI, memory map), device
    /// windows, VMCS defaults plus guest state, hardware
    /// VMCLEAR/VMPTRLD/commit, and registration under both lookup keys.
    ///
    /// `region` must be a fresh VMCS region created on the calling core.
    ///
    /// # Safety
    /// Hardware path: the calling core must be in VMX root operation.
    pub unsafe fn create(
        &self,
        region: Box<Vmcs>,
        image: &[u8],
        ramdisk: &[u8],
        config: VmConfig,
        firmware: Option<&FirmwareTables<'_>>,
        phase: &mut BootPhase,
    ) -> Result<Arc<SpinLock<Vproc>>, VmError> {
        let id = self.allocate_id();
        let mut space = GuestSpace::build(id, image, config.ram_bytes, ramdisk, firmware, phase)?;

        // The virtualized local-APIC page and the I/O-APIC window, both
        // uncached: one is a hypervisor frame, the other passes through.
        let apic_page = Arc::new(Page::new().expect("out of frames for APIC access page"));
        space
            .map_device_page(bedrock::apic::APIC_DEFAULT_BASE, unsafe {
                apic_page.pa().into_usize()
            })
            .map_err(|e| VmError::ControllerError(Box::new(e)))?;
        space
            .map_device_page(bedrock::apic::IOAPIC_BASE, bedrock::apic::IOAPIC_BASE)
            .map_err(|e| VmError::ControllerError(Box::new(e)))?;

        let (ept, entry, cr3) = space.into_parts();
        let mut snapshot = VmcsSnapshot::default();
        snapshot.host = HostState::capture(vmexit_entry_addr());
        snapshot.guest.rip = entry as u64;
        snapshot.guest.rsp = config.stack;
        snapshot.guest.cr3 = cr3 as u64;
        snapshot.guest.gdtr_base = GDT_BASE as u64;
        snapshot.ctrl.vpid = id as u64;
        snapshot.ctrl.eptp = ept.eptp();
        snapshot.ctrl.apic_access_addr = unsafe { apic_page.pa().into_usize() } as u64;

        let mut vproc = Vproc::new(
            id,
            region,
            snapshot,
            Arc::new(SpinLock::new(ept)),
            apic_page,
        );
        vproc.load()?;
        Ok(self.insert(vproc))
    }

    /// Bring a second logical core into an already-running guest: the new
    /// vproc shares the existing one's EPT and APIC-access page, and its
    /// identity-relevant VMCS fields (VPID, EPT pointer, descriptor-table
    /// bases) are copied rather than rebuilt.
    ///
    /// `region` must be a fresh VMCS region created on the joining core.
    pub fn join(
        &self,
        existing: VprocId,
        region: Box<Vmcs>,
        entry_vector: u8,
    ) -> Result<Arc<SpinLock<Vproc>>, VmError> {
        let source = self
            .get(existing)
            .ok_or(VmError::ControllerError(Box::new("joining a dead vproc")))?;
        let id = self.allocate_id();
        let (snapshot, ept, apic_page) = {
            let src = source.lock();
            let mut snapshot = src.snapshot;
            snapshot.guest.rip = (entry_vector as u64) << 12;
            snapshot.guest.rsp = 0;
            // The joined core starts where the SIPI points, on the shared
            // translation tree under the shared VPID.
            (snapshot, src.ept.clone(), src.apic_page.clone())
        };
        let vproc = Vproc::new(id, region, snapshot, ept, apic_page);
        Ok(self.insert(vproc))
    }

    /// Tear a vproc down. Lookup-table removal comes first so no
    /// concurrent lookup can observe a half-freed vproc; then the pieces
    /// fall in order: extended register state, VMCS page, EPT, APIC
    /// page, queues.
    pub fn destroy(&self, id: VprocId) -> Result<(), VmError> {
        let arc = {
            let mut vprocs = self.vprocs.lock();
            let arc = vprocs
                .remove(&id)
                .ok_or(VmError::ControllerError(Box::new("destroying a dead vproc")))?;
            self.by_vmcs
                .lock()
                .retain(|_, owner| *owner != id);
            arc
        };
        match Arc::into_inner(arc) {
            Some(vproc) => vproc.into_inner().dismantle(),
            None => {
                // A joined sibling still shares the EPT; the last one out
                // frees it.
            }
        }
        Ok(())
    }

    /// Park a join request for the core answering the physical SIPI.
    pub fn post_join_request(&self, request: JoinRequest) {
        *self.join_target.lock() = Some(request);
    }

    /// Claim the parked join request, if any.
    pub fn take_join_request(&self) -> Option<JoinRequest> {
        self.join_target.lock().take()
    }
}

/// [`SmpJoin`] implementation that sends the real INIT/SIPI pair.
pub struct PhysicalJoin<'a> {
    ctx: &'a HvContext,
}

impl<'a> PhysicalJoin<'a> {
    /// Join plumbing over `ctx`.
    pub fn new(ctx: &'a HvContext) -> Self {
        Self { ctx }
    }
}

impl SmpJoin for PhysicalJoin<'_> {
    fn join_core(&self, vproc: VprocId, target_apic: u8, entry_vector: u8) -> Result<(), VmError> {
        self.ctx.post_join_request(JoinRequest {
            vproc,
            entry_vector,
        });
        // Each send spins on the APIC delivery-status bit, so the
        // acknowledgment wait the bring-up protocol requires is built in.
        unsafe {
            let apic = bedrock::apic::LocalApic::current();
            apic.start_core(
                target_apic,
                Pa::new((entry_vector as usize) << 12).unwrap(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ept::ExtendedPageTable;
    use crate::test_support::init_mm;

    fn test_vproc(ctx: &HvContext) -> (VprocId, Arc<SpinLock<Vproc>>) {
        init_mm();
        let id = ctx.allocate_id();
        let vmcs = unsafe { Box::<Vmcs>::new_zeroed().assume_init() };
        let vproc = Vproc::new(
            id,
            vmcs,
            VmcsSnapshot::default(),
            Arc::new(SpinLock::new(ExtendedPageTable::new(id))),
            Arc::new(Page::new().unwrap()),
        );
        (id, ctx.insert(vproc))
    }

    #[test]
    fn identifiers_are_monotonic_and_nonzero() {
        let ctx = HvContext::new();
        let a = ctx.allocate_id();
        let b = ctx.allocate_id();
        let c = ctx.allocate_id();
        assert!(a >= 1);
        assert!(a < b && b < c);
    }

    #[test]
    fn lookup_by_id_and_by_vmcs_address() {
        let ctx = HvContext::new();
        let (id, arc) = test_vproc(&ctx);
        let pa = arc.lock().vmcs_pa();

        assert!(Arc::ptr_eq(&ctx.get(id).unwrap(), &arc));
        assert!(Arc::ptr_eq(&ctx.get_by_vmcs(pa).unwrap(), &arc));
        assert!(ctx.get(id + 1000).is_none());
        assert!(ctx.get_by_vmcs(Pa::new(0x1000).unwrap()).is_none());

        ctx.destroy(id).unwrap();
    }

    #[test]
    fn destroy_unregisters_before_release() {
        let ctx = HvContext::new();
        let (id, arc) = test_vproc(&ctx);
        // A second holder (as a joined sibling would be) keeps the pieces
        // alive; destroy must still unregister immediately.
        let keep = arc.clone();
        ctx.destroy(id).unwrap();
        assert!(ctx.get(id).is_none());
        assert!(ctx.get_by_vmcs(keep.lock().vmcs_pa()).is_none());
        assert!(ctx.destroy(id).is_err());
        keep.lock().ept.lock().release_frames();
    }

    #[test]
    fn join_request_slot_round_trips() {
        let ctx = HvContext::new();
        assert!(ctx.take_join_request().is_none());
        ctx.post_join_request(JoinRequest {
            vproc: 3,
            entry_vector: 0x8,
        });
        let req = ctx.take_join_request().unwrap();
        assert_eq!((req.vproc, req.entry_vector), (3, 0x8));
        assert!(ctx.take_join_request().is_none());
    }

    #[test]
    fn join_shares_ept_and_copies_identity() {
        let ctx = HvContext::new();
        let (id, arc) = test_vproc(&ctx);
        {
            let mut src = arc.lock();
            src.snapshot.ctrl.vpid = id as u64;
            src.snapshot.ctrl.eptp = 0xabc000 | 0x1e;
            src.snapshot.guest.gdtr_base = GDT_BASE as u64;
        }
        let joined = ctx
            .join(id, unsafe { Box::<Vmcs>::new_zeroed().assume_init() }, 0x9)
            .unwrap();
        {
            let (a, b) = (arc.lock(), joined.lock());
            assert!(Arc::ptr_eq(&a.ept, &b.ept));
            assert!(Arc::ptr_eq(&a.apic_page, &b.apic_page));
            assert_eq!(b.snapshot.ctrl.vpid, id as u64);
            assert_eq!(b.snapshot.ctrl.eptp, 0xabc000 | 0x1e);
            assert_eq!(b.snapshot.guest.gdtr_base, GDT_BASE as u64);
            assert_eq!(b.snapshot.guest.rip, 0x9 << 12);
            assert_ne!(b.id, a.id);
        }
        let joined_id = joined.lock().id;
        ctx.destroy(joined_id).unwrap();
        ctx.destroy(id).unwrap();
        // Both registrations are gone; the shared tree died with the last
        // holder (no asserts needed: a double free would panic).
    }
}
