//! The hardware/driver boundary.
//!
//! Everything the bring-up sequence needs from the RDMA stack is behind the
//! [`Verbs`] trait: enumeration, context open/close, resource create/destroy,
//! queue-pair attribute modification, and receive posting. Implementations
//! report failure with the step's error kind and an opaque platform code the
//! crate surfaces but never interprets.
//!
//! Two drivers exist, selected by cargo feature:
//! - `real-rdma`: [`sys::SysVerbs`], raw FFI over libibverbs;
//! - `mock-rdma` (default): [`mock::MockVerbs`], an instrumented in-memory
//!   driver so the crate compiles and its tests run without RDMA hardware.

use crate::error::Result;
use crate::qp::QpState;
use crate::types::{AccessFlags, LinkLayer, Mtu, PortPhysicalState, PortState, Transport};

#[cfg(feature = "mock-rdma")]
pub mod mock;
#[cfg(feature = "real-rdma")]
pub mod sys;

/// Opaque driver handle to an open device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Opaque driver handle to a protection domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PdHandle(pub u64);

/// Opaque driver handle to a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CqHandle(pub u64);

/// Opaque driver handle to a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrHandle(pub u64);

/// Opaque driver handle to a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QpHandle(pub u64);

/// Immutable identity of an enumerated device.
///
/// Holds no driver resources: the enumeration list backing it is released
/// before [`Verbs::list_devices`] returns, and a context must be opened
/// from the descriptor before anything else can happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Kernel device name, e.g. `mlx5_0`.
    pub name: String,
    /// Position in the enumeration order.
    pub index: usize,
    /// Transport kind reported by the driver.
    pub transport: Transport,
}

/// Device limits reported by the capability query.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    pub max_qp: u32,
    pub max_cqe: u32,
    pub max_mr_size: u64,
    pub max_sge: u32,
    pub port_count: u8,
}

/// Attributes of one device port.
#[derive(Debug, Clone, Copy)]
pub struct PortInfo {
    pub state: PortState,
    pub phys_state: PortPhysicalState,
    /// Link identifier: the port's switched-fabric address.
    pub lid: u16,
    pub active_mtu: Mtu,
    pub link_layer: LinkLayer,
}

/// Work-queue capacities for queue pair creation.
#[derive(Debug, Clone, Copy)]
pub struct QueueCaps {
    pub send_depth: u32,
    pub recv_depth: u32,
    /// Scatter/gather entries per work request, both directions.
    pub sge_per_wr: u32,
}

/// Result of registering a buffer with a protection domain.
#[derive(Debug, Clone, Copy)]
pub struct RegisteredMemory {
    pub handle: MrHandle,
    /// Key authorizing local work requests against the region.
    pub lkey: u32,
    /// Key the peer needs to address the region remotely.
    pub rkey: u32,
}

/// Result of creating a queue pair (in RESET state).
#[derive(Debug, Clone, Copy)]
pub struct CreatedQueuePair {
    pub handle: QpHandle,
    /// Number unique within the device; part of the wire identity.
    pub qp_num: u32,
}

/// Attribute subset for RESET→INIT. The driver applies exactly the
/// {STATE, PKEY_INDEX, PORT, ACCESS_FLAGS} modification mask.
#[derive(Debug, Clone, Copy)]
pub struct InitAttr {
    pub port: u8,
    pub pkey_index: u16,
    pub access: AccessFlags,
}

/// Attribute subset for INIT→RTR. Requires the peer identity; the driver
/// applies exactly the {STATE, AV, PATH_MTU, DEST_QPN, RQ_PSN,
/// MAX_DEST_RD_ATOMIC, MIN_RNR_TIMER} modification mask.
#[derive(Debug, Clone, Copy)]
pub struct RtrAttr {
    pub mtu: Mtu,
    pub dest_qp_num: u32,
    pub dest_lid: u16,
    pub rq_psn: u32,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub port: u8,
}

/// Attribute subset for RTR→RTS. The driver applies exactly the {STATE,
/// TIMEOUT, RETRY_CNT, RNR_RETRY, SQ_PSN, MAX_QP_RD_ATOMIC} mask.
#[derive(Debug, Clone, Copy)]
pub struct RtsAttr {
    pub timeout: u8,
    pub retry_count: u8,
    pub rnr_retry: u8,
    pub sq_psn: u32,
    pub max_rd_atomic: u8,
}

/// Driver operations consumed by the bring-up sequence.
///
/// Destroy operations are infallible by design: teardown runs on error
/// paths where a secondary failure has nowhere useful to go, so drivers
/// log and swallow destroy-side problems. Destroying a handle twice must
/// not fault.
pub trait Verbs: Send + Sync {
    /// Enumerate available devices. An empty list is `Ok(vec![])`, distinct
    /// from an enumeration failure. Any driver-side list is released before
    /// this returns.
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open a context on the described device. Fails with `DeviceOpenFailed`.
    fn open_device(&self, descriptor: &DeviceDescriptor) -> Result<ContextHandle>;

    fn close_device(&self, ctx: ContextHandle);

    /// Query device limits. Fails with `CapabilityQueryFailed`.
    fn query_device(&self, ctx: ContextHandle) -> Result<DeviceCaps>;

    /// Query one port's attributes. Fails with `PortQueryFailed`.
    fn query_port(&self, ctx: ContextHandle, port: u8) -> Result<PortInfo>;

    /// Fails with `ProtectionDomainAllocationFailed`.
    fn alloc_pd(&self, ctx: ContextHandle) -> Result<PdHandle>;

    fn dealloc_pd(&self, pd: PdHandle);

    /// Create a completion queue with fixed capacity (not resizable).
    /// Fails with `CompletionQueueAllocationFailed`.
    fn create_cq(&self, ctx: ContextHandle, capacity: u32) -> Result<CqHandle>;

    fn destroy_cq(&self, cq: CqHandle);

    /// Register `len` bytes at `addr` under the protection domain.
    /// Fails with `MemoryRegistrationFailed`.
    fn register_memory(
        &self,
        pd: PdHandle,
        addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<RegisteredMemory>;

    fn deregister_memory(&self, mr: MrHandle);

    /// Create a reliable-connection queue pair in RESET state, with both
    /// work queues bound to `cq`. Fails with `QueuePairCreateFailed`.
    fn create_qp(&self, pd: PdHandle, cq: CqHandle, caps: &QueueCaps) -> Result<CreatedQueuePair>;

    fn destroy_qp(&self, qp: QpHandle);

    /// Apply the RESET→INIT attribute subset.
    fn modify_qp_init(&self, qp: QpHandle, attr: &InitAttr) -> Result<()>;

    /// Apply the INIT→RTR attribute subset.
    fn modify_qp_rtr(&self, qp: QpHandle, attr: &RtrAttr) -> Result<()>;

    /// Apply the RTR→RTS attribute subset.
    fn modify_qp_rts(&self, qp: QpHandle, attr: &RtsAttr) -> Result<()>;

    /// Post one receive work request for `len` bytes at `addr`.
    /// `state` is the wrapper-tracked queue pair state, used only for
    /// error reporting. Fails with `ReceivePostFailed`.
    fn post_receive(
        &self,
        qp: QpHandle,
        addr: u64,
        len: u32,
        lkey: u32,
        state: QpState,
    ) -> Result<()>;
}
