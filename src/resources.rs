//! Scoped-ownership wrappers for driver resources.
//!
//! Every wrapper releases its handle in `Drop`, so any partially-built set
//! unwinds automatically in reverse creation order when a bring-up step
//! fails. There are no null-checked teardown paths: ownership is the record
//! of what exists.

use crate::error::{IblinkError, Result};
use crate::types::{AccessFlags, PortPhysicalState};
use crate::verbs::{
    ContextHandle, CqHandle, DeviceCaps, DeviceDescriptor, MrHandle, PdHandle, PortInfo, Verbs,
};
use std::sync::Arc;

/// An open session with one device. Every other resource is created
/// relative to exactly one context and must be released before it.
pub struct DeviceContext {
    driver: Arc<dyn Verbs>,
    handle: ContextHandle,
    device: String,
}

impl DeviceContext {
    pub fn open(driver: Arc<dyn Verbs>, descriptor: &DeviceDescriptor) -> Result<Self> {
        let handle = driver.open_device(descriptor)?;
        tracing::info!(device = %descriptor.name, "device context opened");
        Ok(Self {
            driver,
            handle,
            device: descriptor.name.clone(),
        })
    }

    /// Device limits. Informational, but bring-up treats failure as fatal:
    /// a device that cannot report its limits will not carry a connection.
    pub fn query_capabilities(&self) -> Result<DeviceCaps> {
        self.driver.query_device(self.handle)
    }

    pub fn query_port(&self, port: u8) -> Result<PortInfo> {
        self.driver.query_port(self.handle, port)
    }

    /// Query `port` and require its physical state to be link-up.
    ///
    /// An inactive port cannot carry traffic; the gate fires before
    /// anything beyond the context is allocated.
    pub fn require_link_up(&self, port: u8) -> Result<PortInfo> {
        let info = self.query_port(port)?;
        if info.phys_state != PortPhysicalState::LinkUp {
            return Err(IblinkError::PortNotReady {
                port,
                state: info.phys_state.to_string(),
            });
        }
        Ok(info)
    }

    pub fn device_name(&self) -> &str {
        &self.device
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Verbs> {
        &self.driver
    }

    pub(crate) fn handle(&self) -> ContextHandle {
        self.handle
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device, "closing device context");
        self.driver.close_device(self.handle);
    }
}

/// Scopes which memory regions and queue pairs may reference each other.
pub struct ProtectionDomain {
    driver: Arc<dyn Verbs>,
    handle: PdHandle,
}

impl ProtectionDomain {
    pub fn alloc(ctx: &DeviceContext) -> Result<Self> {
        let handle = ctx.driver().alloc_pd(ctx.handle())?;
        tracing::debug!("protection domain allocated");
        Ok(Self {
            driver: Arc::clone(ctx.driver()),
            handle,
        })
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Verbs> {
        &self.driver
    }

    pub(crate) fn handle(&self) -> PdHandle {
        self.handle
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        self.driver.dealloc_pd(self.handle);
    }
}

/// Bounded ring for completion notifications. Capacity is fixed at
/// creation; the queue is not resizable.
pub struct CompletionQueue {
    driver: Arc<dyn Verbs>,
    handle: CqHandle,
    capacity: u32,
}

impl CompletionQueue {
    pub fn create(ctx: &DeviceContext, capacity: u32) -> Result<Self> {
        let handle = ctx.driver().create_cq(ctx.handle(), capacity)?;
        tracing::debug!(capacity, "completion queue created");
        Ok(Self {
            driver: Arc::clone(ctx.driver()),
            handle,
            capacity,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub(crate) fn handle(&self) -> CqHandle {
        self.handle
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        self.driver.destroy_cq(self.handle);
    }
}

/// A contiguous buffer registered for local and remote access.
///
/// Owns its backing allocation; the registration is released before the
/// buffer is freed (`Drop` deregisters, then the `buf` field drops).
pub struct MemoryRegion {
    driver: Arc<dyn Verbs>,
    handle: MrHandle,
    lkey: u32,
    rkey: u32,
    access: AccessFlags,
    buf: Box<[u8]>,
}

impl MemoryRegion {
    /// Allocate a zeroed `size`-byte buffer and register it under `pd`.
    pub fn register(pd: &ProtectionDomain, size: usize, access: AccessFlags) -> Result<Self> {
        let mut storage: Vec<u8> = Vec::new();
        storage
            .try_reserve_exact(size)
            .map_err(|_| IblinkError::MemoryAllocationFailed { size })?;
        storage.resize(size, 0);
        let buf = storage.into_boxed_slice();

        let registered =
            pd.driver()
                .register_memory(pd.handle(), buf.as_ptr() as u64, size, access)?;
        tracing::debug!(
            addr = format_args!("0x{:x}", buf.as_ptr() as u64),
            lkey = format_args!("0x{:x}", registered.lkey),
            rkey = format_args!("0x{:x}", registered.rkey),
            size,
            "memory region registered"
        );
        Ok(Self {
            driver: Arc::clone(pd.driver()),
            handle: registered.handle,
            lkey: registered.lkey,
            rkey: registered.rkey,
            access,
            buf,
        })
    }

    /// Virtual address of the buffer, as carried in the wire identity.
    pub fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.driver.deregister_memory(self.handle);
        // `buf` drops after this body returns: deregister, then free.
    }
}

#[cfg(all(test, feature = "mock-rdma"))]
mod tests {
    use super::*;
    use crate::verbs::mock::{MockVerbs, Resource};
    use crate::verbs::DeviceDescriptor;
    use crate::types::Transport;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            name: "mock0".into(),
            index: 0,
            transport: Transport::Infiniband,
        }
    }

    #[test]
    fn open_then_drop_releases_the_context() {
        let mock = Arc::new(MockVerbs::new());
        let driver: Arc<dyn Verbs> = Arc::clone(&mock) as Arc<dyn Verbs>;
        let ctx = DeviceContext::open(driver, &descriptor()).unwrap();
        drop(ctx);
        assert_eq!(mock.live_count(), 0);
        assert_eq!(mock.created_order().len(), 1);
        assert!(matches!(mock.destroyed_order()[0], Resource::Context(_)));
    }

    #[test]
    fn link_down_port_is_rejected() {
        let mock = Arc::new(MockVerbs::new());
        mock.set_phys_state(crate::types::PortPhysicalState::Disabled);
        let driver: Arc<dyn Verbs> = Arc::clone(&mock) as Arc<dyn Verbs>;
        let ctx = DeviceContext::open(driver, &descriptor()).unwrap();

        let err = ctx.require_link_up(1).unwrap_err();
        match err {
            IblinkError::PortNotReady { port, state } => {
                assert_eq!(port, 1);
                assert_eq!(state, "DISABLED");
            }
            other => panic!("expected PortNotReady, got {other}"),
        }
    }

    #[test]
    fn memory_region_exposes_keys_and_buffer() {
        let mock = Arc::new(MockVerbs::new());
        let driver: Arc<dyn Verbs> = Arc::clone(&mock) as Arc<dyn Verbs>;
        let ctx = DeviceContext::open(driver, &descriptor()).unwrap();
        let pd = ProtectionDomain::alloc(&ctx).unwrap();

        let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
        let mut mr = MemoryRegion::register(&pd, 1024, access).unwrap();
        assert_eq!(mr.len(), 1024);
        assert_ne!(mr.lkey(), mr.rkey());
        assert_eq!(mr.addr(), mr.as_slice().as_ptr() as u64);
        assert!(mr.access().contains(AccessFlags::REMOTE_WRITE));
        mr.as_mut_slice()[0] = 0xAB;
        assert_eq!(mr.as_slice()[0], 0xAB);
    }
}
