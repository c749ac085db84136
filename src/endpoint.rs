//! Endpoint orchestration: the full bring-up sequence and its aggregate.
//!
//! `Endpoint::bring_up` drives enumerate → select → open → capability and
//! port queries → link-up gate → protection domain → completion queue →
//! memory registration → queue pair → INIT → (responder: post receive) →
//! rendezvous → RTR → RTS. A failure at any step unwinds every resource
//! created so far, in reverse order, before the error propagates; nothing
//! is retried.

use crate::channel;
use crate::device::{self, DeviceQuery};
use crate::error::Result;
use crate::qp::{QpState, QueuePair};
use crate::resources::{CompletionQueue, DeviceContext, MemoryRegion, ProtectionDomain};
use crate::types::{AccessFlags, Mtu};
use crate::verbs::{DeviceCaps, InitAttr, PortInfo, QueueCaps, RtrAttr, RtsAttr, Verbs};
use crate::wire::EndpointIdentity;
use std::io::{Read, Write};
use std::sync::Arc;

/// Access every registered buffer carries: local write for receives,
/// remote read/write so the peer can run one-sided operations against it.
const BUFFER_ACCESS: AccessFlags = AccessFlags(
    AccessFlags::LOCAL_WRITE.0 | AccessFlags::REMOTE_READ.0 | AccessFlags::REMOTE_WRITE.0,
);

/// Which side of the connection this endpoint plays.
///
/// The responder is the side that must have a receive request posted
/// before the link goes live; a connection that never posts a receive
/// buffer cannot accept incoming sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Tuning for one bring-up attempt. Defaults are the classic
/// single-outstanding, 1 KiB pingpong values.
#[derive(Debug, Clone)]
pub struct BringupConfig {
    pub device: DeviceQuery,
    pub port: u8,
    pub cq_capacity: u32,
    pub buffer_size: usize,
    pub queue_caps: QueueCaps,
    /// Path MTU applied at the RTR transition.
    pub mtu: Mtu,
    pub pkey_index: u16,
    pub min_rnr_timer: u8,
    pub timeout: u8,
    pub retry_count: u8,
    pub rnr_retry: u8,
    /// Max outstanding RDMA-read/atomic operations, both directions.
    pub max_rd_atomic: u8,
    pub role: Role,
}

impl Default for BringupConfig {
    fn default() -> Self {
        Self {
            device: DeviceQuery::Index(0),
            port: 1,
            cq_capacity: 0x10,
            buffer_size: 1024,
            queue_caps: QueueCaps {
                send_depth: 1,
                recv_depth: 1,
                sge_per_wr: 1,
            },
            mtu: Mtu::Mtu1024,
            pkey_index: 0,
            min_rnr_timer: 0x12,
            timeout: 0x12,
            retry_count: 7,
            rnr_retry: 7,
            max_rd_atomic: 1,
            role: Role::Initiator,
        }
    }
}

impl BringupConfig {
    /// Load overrides from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `IBLINK_DEVICE` (kernel name; takes precedence over the index)
    /// - `IBLINK_DEVICE_INDEX`
    /// - `IBLINK_PORT`
    /// - `IBLINK_CQ_CAPACITY`
    /// - `IBLINK_BUFFER_BYTES`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("IBLINK_DEVICE_INDEX") {
            if let Ok(i) = v.parse::<usize>() {
                cfg.device = DeviceQuery::Index(i);
            }
        }
        if let Ok(name) = std::env::var("IBLINK_DEVICE") {
            if !name.is_empty() {
                cfg.device = DeviceQuery::Name(name);
            }
        }
        if let Ok(v) = std::env::var("IBLINK_PORT") {
            if let Ok(p) = v.parse::<u8>() {
                cfg.port = p;
            }
        }
        if let Ok(v) = std::env::var("IBLINK_CQ_CAPACITY") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.cq_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("IBLINK_BUFFER_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.buffer_size = n;
            }
        }

        cfg
    }
}

/// A fully connected endpoint: queue pair in RTS, both identities known.
///
/// This is the data-plane handoff point; posting sends and polling
/// completions are the next layer's job.
pub struct Endpoint {
    // Field order is load-bearing: struct fields drop in declaration
    // order, so aggregate drop tears down in the exact reverse of
    // creation: qp → mr (→ its buffer) → cq → pd → ctx.
    qp: QueuePair,
    mr: MemoryRegion,
    cq: CompletionQueue,
    pd: ProtectionDomain,
    ctx: DeviceContext,
    caps: DeviceCaps,
    port: PortInfo,
    local: EndpointIdentity,
    remote: EndpointIdentity,
}

impl Endpoint {
    /// Run the full bring-up sequence against `driver`, using `channel`
    /// for the identity rendezvous.
    ///
    /// Blocks until both peers have exchanged identities or a step fails.
    /// On failure every resource created so far is released, in reverse
    /// creation order, before the error is returned; the caller never
    /// observes a half-built endpoint.
    pub fn bring_up<C: Read + Write>(
        driver: Arc<dyn Verbs>,
        config: &BringupConfig,
        channel: &mut C,
    ) -> Result<Self> {
        // Locals drop in reverse declaration order, so an early `?` return
        // unwinds exactly the teardown sequence the aggregate guarantees.
        let devices = device::list_devices(driver.as_ref())?;
        let descriptor = device::select_device(&devices, &config.device)?;

        let ctx = DeviceContext::open(Arc::clone(&driver), &descriptor)?;
        let caps = ctx.query_capabilities()?;
        tracing::debug!(
            max_qp = caps.max_qp,
            max_sge = caps.max_sge,
            ports = caps.port_count,
            "device capabilities"
        );
        let port = ctx.require_link_up(config.port)?;
        tracing::debug!(
            lid = format_args!("0x{:x}", port.lid),
            state = %port.state,
            mtu = %port.active_mtu,
            "port is link-up"
        );

        let pd = ProtectionDomain::alloc(&ctx)?;
        let cq = CompletionQueue::create(&ctx, config.cq_capacity)?;
        let mr = MemoryRegion::register(&pd, config.buffer_size, BUFFER_ACCESS)?;
        let mut qp = QueuePair::create(&pd, &cq, &config.queue_caps)?;

        qp.to_init(&InitAttr {
            port: config.port,
            pkey_index: config.pkey_index,
            access: BUFFER_ACCESS,
        })?;

        // The responder needs a landing slot armed before the peer can
        // legally send; post it while still short of RTR.
        if config.role == Role::Responder {
            qp.post_receive(&mr)?;
        }

        let local = EndpointIdentity {
            addr: mr.addr(),
            rkey: mr.rkey(),
            qp_num: qp.qp_num(),
            lid: port.lid,
        };
        tracing::info!(local = %local, role = ?config.role, "starting identity rendezvous");
        let remote = channel::exchange(channel, &local)?;

        qp.to_rtr(&RtrAttr {
            mtu: config.mtu,
            dest_qp_num: remote.qp_num,
            dest_lid: remote.lid,
            rq_psn: 0,
            max_dest_rd_atomic: config.max_rd_atomic,
            min_rnr_timer: config.min_rnr_timer,
            port: config.port,
        })?;
        qp.to_rts(&RtsAttr {
            timeout: config.timeout,
            retry_count: config.retry_count,
            rnr_retry: config.rnr_retry,
            sq_psn: 0,
            max_rd_atomic: config.max_rd_atomic,
        })?;

        tracing::info!(
            device = %ctx.device_name(),
            qp_num = format_args!("0x{:x}", qp.qp_num()),
            remote_qp = format_args!("0x{:x}", remote.qp_num),
            "endpoint ready to send"
        );
        Ok(Self {
            qp,
            mr,
            cq,
            pd,
            ctx,
            caps,
            port,
            local,
            remote,
        })
    }

    /// Identity this endpoint sent to the peer.
    pub fn local_identity(&self) -> EndpointIdentity {
        self.local
    }

    /// Identity received from the peer during rendezvous.
    pub fn remote_identity(&self) -> EndpointIdentity {
        self.remote
    }

    pub fn state(&self) -> QpState {
        self.qp.state()
    }

    pub fn queue_pair(&self) -> &QueuePair {
        &self.qp
    }

    pub fn capabilities(&self) -> DeviceCaps {
        self.caps
    }

    pub fn port_info(&self) -> PortInfo {
        self.port
    }

    pub fn device_name(&self) -> &str {
        self.ctx.device_name()
    }

    pub fn completion_queue(&self) -> &CompletionQueue {
        &self.cq
    }

    pub fn protection_domain(&self) -> &ProtectionDomain {
        &self.pd
    }

    /// The registered buffer, for staging data before the first send.
    pub fn buffer(&self) -> &[u8] {
        self.mr.as_slice()
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.mr.as_mut_slice()
    }
}

impl std::fmt::Debug for Endpoint {
    // The resource wrappers hold an `Arc<dyn Verbs>`, which is not `Debug`;
    // surface the inspectable identity/state fields instead of the handles.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("device", &self.ctx.device_name())
            .field("state", &self.qp.state())
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}
