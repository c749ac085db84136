//! Instrumented in-memory driver.
//!
//! Stands in for the RDMA stack on machines without hardware: hands out
//! fake handles, keys, and queue pair numbers, records every create,
//! destroy, and transition in order, and can be told to fail at any single
//! bring-up step. Tests use the event log to assert the reverse-order
//! teardown and rendezvous-before-RTR properties.

use super::{
    ContextHandle, CqHandle, CreatedQueuePair, DeviceCaps, DeviceDescriptor, InitAttr, MrHandle,
    PdHandle, PortInfo, QpHandle, QueueCaps, RegisteredMemory, RtrAttr, RtsAttr, Verbs,
};
use crate::error::{Errno, IblinkError, Result};
use crate::qp::QpState;
use crate::types::{AccessFlags, LinkLayer, Mtu, PortPhysicalState, PortState, Transport};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A driver call [`MockVerbs`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    ListDevices,
    OpenDevice,
    QueryDevice,
    QueryPort,
    AllocPd,
    CreateCq,
    RegisterMemory,
    CreateQp,
    ModifyInit,
    ModifyRtr,
    ModifyRts,
    PostReceive,
}

/// A driver-owned resource, identified by its fake handle value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Context(u64),
    Pd(u64),
    Cq(u64),
    Mr(u64),
    Qp(u64),
}

/// One recorded driver event, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Created(Resource),
    Destroyed(Resource),
    TransitionedToInit {
        qp: u64,
    },
    TransitionedToRtr {
        qp: u64,
        dest_qp_num: u32,
        dest_lid: u16,
    },
    TransitionedToRts {
        qp: u64,
    },
    ReceivePosted {
        qp: u64,
        len: u32,
    },
}

const LID_BASE: u16 = 0x11;
const QP_NUM_BASE: u64 = 0x100;

pub struct MockVerbs {
    devices: Vec<String>,
    phys_state: Mutex<PortPhysicalState>,
    fail_at: Mutex<Option<Step>>,
    next_handle: AtomicU64,
    next_qp_num: AtomicU64,
    next_key: AtomicU64,
    live: Mutex<HashSet<Resource>>,
    events: Mutex<Vec<Event>>,
    ctx_device: Mutex<HashMap<u64, usize>>,
}

impl MockVerbs {
    /// One device (`mock0`), port link-up, nothing failing.
    pub fn new() -> Self {
        Self::with_devices(&["mock0"])
    }

    pub fn with_devices(names: &[&str]) -> Self {
        Self {
            devices: names.iter().map(|n| n.to_string()).collect(),
            phys_state: Mutex::new(PortPhysicalState::LinkUp),
            fail_at: Mutex::new(None),
            next_handle: AtomicU64::new(1),
            next_qp_num: AtomicU64::new(QP_NUM_BASE),
            next_key: AtomicU64::new(1),
            live: Mutex::new(HashSet::new()),
            events: Mutex::new(Vec::new()),
            ctx_device: Mutex::new(HashMap::new()),
        }
    }

    /// Physical state reported for every port from now on.
    pub fn set_phys_state(&self, state: PortPhysicalState) {
        *self.phys_state.lock().expect("mock state") = state;
    }

    /// Fail the next (and every) call matching `step` until cleared.
    pub fn fail_at(&self, step: Step) {
        *self.fail_at.lock().expect("mock state") = Some(step);
    }

    pub fn clear_failure(&self) {
        *self.fail_at.lock().expect("mock state") = None;
    }

    /// Every recorded event, in call order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("mock state").clone()
    }

    /// Resources created, in creation order.
    pub fn created_order(&self) -> Vec<Resource> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Created(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// Resources destroyed, in destruction order.
    pub fn destroyed_order(&self) -> Vec<Resource> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Destroyed(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// Number of handles created but not yet destroyed.
    pub fn live_count(&self) -> usize {
        self.live.lock().expect("mock state").len()
    }

    /// LID the mock reports for the given device index.
    pub fn lid_for(index: usize) -> u16 {
        LID_BASE + index as u16
    }

    fn trip(&self, step: Step) -> bool {
        *self.fail_at.lock().expect("mock state") == Some(step)
    }

    fn fresh_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn record_created(&self, resource: Resource) {
        self.live.lock().expect("mock state").insert(resource);
        self.events
            .lock()
            .expect("mock state")
            .push(Event::Created(resource));
    }

    /// Destroys are idempotent: a handle already gone is a silent no-op,
    /// never a fault.
    fn record_destroyed(&self, resource: Resource) {
        let was_live = self.live.lock().expect("mock state").remove(&resource);
        if was_live {
            self.events
                .lock()
                .expect("mock state")
                .push(Event::Destroyed(resource));
        }
    }

    fn push_event(&self, event: Event) {
        self.events.lock().expect("mock state").push(event);
    }
}

impl Default for MockVerbs {
    fn default() -> Self {
        Self::new()
    }
}

impl Verbs for MockVerbs {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        if self.trip(Step::ListDevices) {
            return Err(IblinkError::DeviceEnumerationFailed {
                errno: Errno::none(),
            });
        }
        Ok(self
            .devices
            .iter()
            .enumerate()
            .map(|(index, name)| DeviceDescriptor {
                name: name.clone(),
                index,
                transport: Transport::Infiniband,
            })
            .collect())
    }

    fn open_device(&self, descriptor: &DeviceDescriptor) -> Result<ContextHandle> {
        let index = self
            .devices
            .iter()
            .position(|name| *name == descriptor.name);
        let index = match index {
            Some(i) if !self.trip(Step::OpenDevice) => i,
            _ => {
                return Err(IblinkError::DeviceOpenFailed {
                    device: descriptor.name.clone(),
                    errno: Errno::none(),
                })
            }
        };
        let handle = self.fresh_handle();
        self.ctx_device
            .lock()
            .expect("mock state")
            .insert(handle, index);
        self.record_created(Resource::Context(handle));
        Ok(ContextHandle(handle))
    }

    fn close_device(&self, ctx: ContextHandle) {
        self.record_destroyed(Resource::Context(ctx.0));
    }

    fn query_device(&self, _ctx: ContextHandle) -> Result<DeviceCaps> {
        if self.trip(Step::QueryDevice) {
            return Err(IblinkError::CapabilityQueryFailed {
                errno: Errno::none(),
            });
        }
        Ok(DeviceCaps {
            max_qp: 131072,
            max_cqe: 4194303,
            max_mr_size: 1 << 40,
            max_sge: 30,
            port_count: 1,
        })
    }

    fn query_port(&self, ctx: ContextHandle, port: u8) -> Result<PortInfo> {
        if self.trip(Step::QueryPort) {
            return Err(IblinkError::PortQueryFailed {
                port,
                errno: Errno::none(),
            });
        }
        let phys_state = *self.phys_state.lock().expect("mock state");
        let index = self
            .ctx_device
            .lock()
            .expect("mock state")
            .get(&ctx.0)
            .copied()
            .unwrap_or(0);
        Ok(PortInfo {
            state: if phys_state == PortPhysicalState::LinkUp {
                PortState::Active
            } else {
                PortState::Down
            },
            phys_state,
            lid: Self::lid_for(index),
            active_mtu: Mtu::Mtu4096,
            link_layer: LinkLayer::Infiniband,
        })
    }

    fn alloc_pd(&self, _ctx: ContextHandle) -> Result<PdHandle> {
        if self.trip(Step::AllocPd) {
            return Err(IblinkError::ProtectionDomainAllocationFailed {
                errno: Errno::none(),
            });
        }
        let handle = self.fresh_handle();
        self.record_created(Resource::Pd(handle));
        Ok(PdHandle(handle))
    }

    fn dealloc_pd(&self, pd: PdHandle) {
        self.record_destroyed(Resource::Pd(pd.0));
    }

    fn create_cq(&self, _ctx: ContextHandle, capacity: u32) -> Result<CqHandle> {
        if self.trip(Step::CreateCq) {
            return Err(IblinkError::CompletionQueueAllocationFailed {
                capacity,
                errno: Errno::none(),
            });
        }
        let handle = self.fresh_handle();
        self.record_created(Resource::Cq(handle));
        Ok(CqHandle(handle))
    }

    fn destroy_cq(&self, cq: CqHandle) {
        self.record_destroyed(Resource::Cq(cq.0));
    }

    fn register_memory(
        &self,
        _pd: PdHandle,
        _addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<RegisteredMemory> {
        if self.trip(Step::RegisterMemory) {
            return Err(IblinkError::MemoryRegistrationFailed {
                size: len,
                access: access.bits(),
                errno: Errno::none(),
            });
        }
        let n = self.next_key.fetch_add(1, Ordering::Relaxed) as u32;
        let handle = self.fresh_handle();
        self.record_created(Resource::Mr(handle));
        Ok(RegisteredMemory {
            handle: MrHandle(handle),
            lkey: 0x1000 + n,
            rkey: 0x2000 + n,
        })
    }

    fn deregister_memory(&self, mr: MrHandle) {
        self.record_destroyed(Resource::Mr(mr.0));
    }

    fn create_qp(
        &self,
        _pd: PdHandle,
        _cq: CqHandle,
        _caps: &QueueCaps,
    ) -> Result<CreatedQueuePair> {
        if self.trip(Step::CreateQp) {
            return Err(IblinkError::QueuePairCreateFailed {
                errno: Errno::none(),
            });
        }
        let qp_num = self.next_qp_num.fetch_add(1, Ordering::Relaxed) as u32;
        let handle = self.fresh_handle();
        self.record_created(Resource::Qp(handle));
        Ok(CreatedQueuePair {
            handle: QpHandle(handle),
            qp_num,
        })
    }

    fn destroy_qp(&self, qp: QpHandle) {
        self.record_destroyed(Resource::Qp(qp.0));
    }

    fn modify_qp_init(&self, qp: QpHandle, _attr: &InitAttr) -> Result<()> {
        if self.trip(Step::ModifyInit) {
            return Err(IblinkError::QpInitTransitionFailed {
                from: QpState::Reset,
                errno: Errno::none(),
            });
        }
        self.push_event(Event::TransitionedToInit { qp: qp.0 });
        Ok(())
    }

    fn modify_qp_rtr(&self, qp: QpHandle, attr: &RtrAttr) -> Result<()> {
        if self.trip(Step::ModifyRtr) {
            return Err(IblinkError::QpRtrTransitionFailed {
                from: QpState::Init,
                errno: Errno::none(),
            });
        }
        self.push_event(Event::TransitionedToRtr {
            qp: qp.0,
            dest_qp_num: attr.dest_qp_num,
            dest_lid: attr.dest_lid,
        });
        Ok(())
    }

    fn modify_qp_rts(&self, qp: QpHandle, _attr: &RtsAttr) -> Result<()> {
        if self.trip(Step::ModifyRts) {
            return Err(IblinkError::QpRtsTransitionFailed {
                from: QpState::ReadyToReceive,
                errno: Errno::none(),
            });
        }
        self.push_event(Event::TransitionedToRts { qp: qp.0 });
        Ok(())
    }

    fn post_receive(
        &self,
        qp: QpHandle,
        _addr: u64,
        len: u32,
        _lkey: u32,
        state: QpState,
    ) -> Result<()> {
        if self.trip(Step::PostReceive) {
            return Err(IblinkError::ReceivePostFailed {
                state,
                errno: Errno::none(),
            });
        }
        self.push_event(Event::ReceivePosted { qp: qp.0, len });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_device_list_is_ok_not_error() {
        let mock = MockVerbs::with_devices(&[]);
        let devices = mock.list_devices().unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn enumeration_failure_is_distinct_from_empty() {
        let mock = MockVerbs::new();
        mock.fail_at(Step::ListDevices);
        assert!(matches!(
            mock.list_devices().unwrap_err(),
            IblinkError::DeviceEnumerationFailed { .. }
        ));
    }

    #[test]
    fn destroy_is_idempotent() {
        let mock = MockVerbs::new();
        let descriptor = &mock.list_devices().unwrap()[0];
        let ctx = mock.open_device(descriptor).unwrap();
        mock.close_device(ctx);
        mock.close_device(ctx); // must not fault, must not double-record
        assert_eq!(mock.live_count(), 0);
        assert_eq!(
            mock.destroyed_order(),
            vec![Resource::Context(ctx.0)]
        );
    }

    #[test]
    fn lids_differ_per_device() {
        let mock = MockVerbs::with_devices(&["mock0", "mock1"]);
        let devices = mock.list_devices().unwrap();
        let c0 = mock.open_device(&devices[0]).unwrap();
        let c1 = mock.open_device(&devices[1]).unwrap();
        let p0 = mock.query_port(c0, 1).unwrap();
        let p1 = mock.query_port(c1, 1).unwrap();
        assert_ne!(p0.lid, p1.lid);
    }
}
