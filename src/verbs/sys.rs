//! Real driver over libibverbs, via raw `ibverbs-sys` FFI.
//!
//! Handles are the underlying pointers, stored as integers. Each modify
//! call applies exactly the attribute mask its transition defines; fields
//! outside the mask are left zeroed and never relied upon.

use super::{
    ContextHandle, CqHandle, CreatedQueuePair, DeviceCaps, DeviceDescriptor, InitAttr, MrHandle,
    PdHandle, PortInfo, QpHandle, QueueCaps, RegisteredMemory, RtrAttr, RtsAttr, Verbs,
};
use crate::error::{Errno, IblinkError, Result};
use crate::qp::QpState;
use crate::types::{AccessFlags, LinkLayer, Mtu, PortPhysicalState, PortState, Transport};
use std::ffi::CStr;
use std::os::raw::c_int;
use std::ptr;

pub struct SysVerbs;

impl SysVerbs {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SysVerbs {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f` over the freshly-fetched device list, then free the list before
/// returning whatever `f` produced. The list never escapes this scope.
unsafe fn with_device_list<T>(
    f: impl FnOnce(&[*mut ibverbs_sys::ibv_device]) -> T,
) -> Result<T> {
    let mut num_devices: c_int = 0;
    let list = ibverbs_sys::ibv_get_device_list(&mut num_devices);
    if list.is_null() {
        return Err(IblinkError::DeviceEnumerationFailed {
            errno: Errno::last_os_error(),
        });
    }
    let devices = std::slice::from_raw_parts(list, num_devices as usize);
    let out = f(devices);
    ibverbs_sys::ibv_free_device_list(list);
    Ok(out)
}

unsafe fn device_name(dev: *mut ibverbs_sys::ibv_device) -> String {
    let name = ibverbs_sys::ibv_get_device_name(dev);
    if name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(name).to_string_lossy().into_owned()
    }
}

impl Verbs for SysVerbs {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        unsafe {
            with_device_list(|devices| {
                devices
                    .iter()
                    .enumerate()
                    .map(|(index, &dev)| DeviceDescriptor {
                        name: device_name(dev),
                        index,
                        transport: Transport::from_raw((*dev).transport_type),
                    })
                    .collect()
            })
        }
    }

    fn open_device(&self, descriptor: &DeviceDescriptor) -> Result<ContextHandle> {
        let ctx = unsafe {
            with_device_list(|devices| {
                for &dev in devices {
                    if device_name(dev) == descriptor.name {
                        return ibverbs_sys::ibv_open_device(dev);
                    }
                }
                ptr::null_mut()
            })?
        };
        if ctx.is_null() {
            return Err(IblinkError::DeviceOpenFailed {
                device: descriptor.name.clone(),
                errno: Errno::last_os_error(),
            });
        }
        Ok(ContextHandle(ctx as u64))
    }

    fn close_device(&self, ctx: ContextHandle) {
        unsafe {
            ibverbs_sys::ibv_close_device(ctx.0 as *mut ibverbs_sys::ibv_context);
        }
    }

    fn query_device(&self, ctx: ContextHandle) -> Result<DeviceCaps> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_device_attr = std::mem::zeroed();
            let rc = ibverbs_sys::ibv_query_device(
                ctx.0 as *mut ibverbs_sys::ibv_context,
                &mut attr,
            );
            if rc != 0 {
                return Err(IblinkError::CapabilityQueryFailed {
                    errno: Errno(Some(rc)),
                });
            }
            Ok(DeviceCaps {
                max_qp: attr.max_qp as u32,
                max_cqe: attr.max_cqe as u32,
                max_mr_size: attr.max_mr_size,
                max_sge: attr.max_sge as u32,
                port_count: attr.phys_port_cnt,
            })
        }
    }

    fn query_port(&self, ctx: ContextHandle, port: u8) -> Result<PortInfo> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_port_attr = std::mem::zeroed();
            // The verbs header renames ibv_query_port to this compat symbol.
            let rc = ibverbs_sys::___ibv_query_port(
                ctx.0 as *mut ibverbs_sys::ibv_context,
                port,
                &mut attr,
            );
            if rc != 0 {
                return Err(IblinkError::PortQueryFailed {
                    port,
                    errno: Errno(Some(rc)),
                });
            }
            Ok(PortInfo {
                state: PortState::from_raw(attr.state as u32),
                phys_state: PortPhysicalState::from_raw(attr.phys_state as u32),
                lid: attr.lid,
                active_mtu: Mtu::from_raw(attr.active_mtu as u32),
                link_layer: LinkLayer::from_raw(attr.link_layer as u32),
            })
        }
    }

    fn alloc_pd(&self, ctx: ContextHandle) -> Result<PdHandle> {
        let pd = unsafe { ibverbs_sys::ibv_alloc_pd(ctx.0 as *mut ibverbs_sys::ibv_context) };
        if pd.is_null() {
            return Err(IblinkError::ProtectionDomainAllocationFailed {
                errno: Errno::last_os_error(),
            });
        }
        Ok(PdHandle(pd as u64))
    }

    fn dealloc_pd(&self, pd: PdHandle) {
        unsafe {
            ibverbs_sys::ibv_dealloc_pd(pd.0 as *mut ibverbs_sys::ibv_pd);
        }
    }

    fn create_cq(&self, ctx: ContextHandle, capacity: u32) -> Result<CqHandle> {
        let cq = unsafe {
            ibverbs_sys::ibv_create_cq(
                ctx.0 as *mut ibverbs_sys::ibv_context,
                capacity as c_int,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        if cq.is_null() {
            return Err(IblinkError::CompletionQueueAllocationFailed {
                capacity,
                errno: Errno::last_os_error(),
            });
        }
        Ok(CqHandle(cq as u64))
    }

    fn destroy_cq(&self, cq: CqHandle) {
        unsafe {
            ibverbs_sys::ibv_destroy_cq(cq.0 as *mut ibverbs_sys::ibv_cq);
        }
    }

    fn register_memory(
        &self,
        pd: PdHandle,
        addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<RegisteredMemory> {
        let mr = unsafe {
            ibverbs_sys::ibv_reg_mr(
                pd.0 as *mut ibverbs_sys::ibv_pd,
                addr as *mut std::os::raw::c_void,
                len,
                access.bits() as c_int,
            )
        };
        if mr.is_null() {
            return Err(IblinkError::MemoryRegistrationFailed {
                size: len,
                access: access.bits(),
                errno: Errno::last_os_error(),
            });
        }
        unsafe {
            Ok(RegisteredMemory {
                handle: MrHandle(mr as u64),
                lkey: (*mr).lkey,
                rkey: (*mr).rkey,
            })
        }
    }

    fn deregister_memory(&self, mr: MrHandle) {
        unsafe {
            ibverbs_sys::ibv_dereg_mr(mr.0 as *mut ibverbs_sys::ibv_mr);
        }
    }

    fn create_qp(&self, pd: PdHandle, cq: CqHandle, caps: &QueueCaps) -> Result<CreatedQueuePair> {
        unsafe {
            let mut init_attr: ibverbs_sys::ibv_qp_init_attr = std::mem::zeroed();
            init_attr.qp_type = ibverbs_sys::ibv_qp_type::IBV_QPT_RC;
            init_attr.sq_sig_all = 1;
            init_attr.send_cq = cq.0 as *mut ibverbs_sys::ibv_cq;
            init_attr.recv_cq = cq.0 as *mut ibverbs_sys::ibv_cq;
            init_attr.cap.max_send_wr = caps.send_depth;
            init_attr.cap.max_recv_wr = caps.recv_depth;
            init_attr.cap.max_send_sge = caps.sge_per_wr;
            init_attr.cap.max_recv_sge = caps.sge_per_wr;

            let qp = ibverbs_sys::ibv_create_qp(pd.0 as *mut ibverbs_sys::ibv_pd, &mut init_attr);
            if qp.is_null() {
                return Err(IblinkError::QueuePairCreateFailed {
                    errno: Errno::last_os_error(),
                });
            }
            Ok(CreatedQueuePair {
                handle: QpHandle(qp as u64),
                qp_num: (*qp).qp_num,
            })
        }
    }

    fn destroy_qp(&self, qp: QpHandle) {
        unsafe {
            ibverbs_sys::ibv_destroy_qp(qp.0 as *mut ibverbs_sys::ibv_qp);
        }
    }

    fn modify_qp_init(&self, qp: QpHandle, attr: &InitAttr) -> Result<()> {
        unsafe {
            let mut qp_attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            qp_attr.qp_state = ibverbs_sys::ibv_qp_state::IBV_QPS_INIT;
            qp_attr.pkey_index = attr.pkey_index;
            qp_attr.port_num = attr.port;
            qp_attr.qp_access_flags = attr.access.bits();

            let mask = ibverbs_sys::ibv_qp_attr_mask::IBV_QP_STATE
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_PORT
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;

            let rc = ibverbs_sys::ibv_modify_qp(
                qp.0 as *mut ibverbs_sys::ibv_qp,
                &mut qp_attr,
                mask.0 as c_int,
            );
            if rc != 0 {
                return Err(IblinkError::QpInitTransitionFailed {
                    from: QpState::Reset,
                    errno: Errno(Some(rc)),
                });
            }
            Ok(())
        }
    }

    fn modify_qp_rtr(&self, qp: QpHandle, attr: &RtrAttr) -> Result<()> {
        unsafe {
            let path_mtu = match attr.mtu {
                Mtu::Mtu256 => ibverbs_sys::IBV_MTU_256,
                Mtu::Mtu512 => ibverbs_sys::IBV_MTU_512,
                Mtu::Mtu1024 => ibverbs_sys::IBV_MTU_1024,
                Mtu::Mtu2048 => ibverbs_sys::IBV_MTU_2048,
                Mtu::Mtu4096 => ibverbs_sys::IBV_MTU_4096,
                Mtu::Unsupported => {
                    return Err(IblinkError::QpRtrTransitionFailed {
                        from: QpState::Init,
                        errno: Errno::none(),
                    })
                }
            };

            let mut qp_attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            qp_attr.qp_state = ibverbs_sys::ibv_qp_state::IBV_QPS_RTR;
            qp_attr.path_mtu = path_mtu;
            qp_attr.dest_qp_num = attr.dest_qp_num;
            qp_attr.rq_psn = attr.rq_psn;
            qp_attr.max_dest_rd_atomic = attr.max_dest_rd_atomic;
            qp_attr.min_rnr_timer = attr.min_rnr_timer;
            qp_attr.ah_attr.is_global = 0;
            qp_attr.ah_attr.dlid = attr.dest_lid;
            qp_attr.ah_attr.sl = 0;
            qp_attr.ah_attr.src_path_bits = 0;
            qp_attr.ah_attr.port_num = attr.port;

            let mask = ibverbs_sys::ibv_qp_attr_mask::IBV_QP_STATE
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_AV
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

            let rc = ibverbs_sys::ibv_modify_qp(
                qp.0 as *mut ibverbs_sys::ibv_qp,
                &mut qp_attr,
                mask.0 as c_int,
            );
            if rc != 0 {
                return Err(IblinkError::QpRtrTransitionFailed {
                    from: QpState::Init,
                    errno: Errno(Some(rc)),
                });
            }
            Ok(())
        }
    }

    fn modify_qp_rts(&self, qp: QpHandle, attr: &RtsAttr) -> Result<()> {
        unsafe {
            let mut qp_attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            qp_attr.qp_state = ibverbs_sys::ibv_qp_state::IBV_QPS_RTS;
            qp_attr.timeout = attr.timeout;
            qp_attr.retry_cnt = attr.retry_count;
            qp_attr.rnr_retry = attr.rnr_retry;
            qp_attr.sq_psn = attr.sq_psn;
            qp_attr.max_rd_atomic = attr.max_rd_atomic;

            let mask = ibverbs_sys::ibv_qp_attr_mask::IBV_QP_STATE
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_SQ_PSN
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;

            let rc = ibverbs_sys::ibv_modify_qp(
                qp.0 as *mut ibverbs_sys::ibv_qp,
                &mut qp_attr,
                mask.0 as c_int,
            );
            if rc != 0 {
                return Err(IblinkError::QpRtsTransitionFailed {
                    from: QpState::ReadyToReceive,
                    errno: Errno(Some(rc)),
                });
            }
            Ok(())
        }
    }

    fn post_receive(
        &self,
        qp: QpHandle,
        addr: u64,
        len: u32,
        lkey: u32,
        state: QpState,
    ) -> Result<()> {
        unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = addr;
            sge.length = len;
            sge.lkey = lkey;

            let mut wr: ibverbs_sys::ibv_recv_wr = std::mem::zeroed();
            wr.wr_id = 0;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;

            let qp = qp.0 as *mut ibverbs_sys::ibv_qp;
            let mut bad_wr: *mut ibverbs_sys::ibv_recv_wr = ptr::null_mut();
            let ctx = (*qp).context;
            let ops = &mut (*ctx).ops;
            let rc = ops.post_recv.as_mut().expect("post_recv missing")(
                qp,
                &mut wr as *mut _,
                &mut bad_wr as *mut _,
            );
            if rc != 0 {
                return Err(IblinkError::ReceivePostFailed {
                    state,
                    errno: Errno(Some(rc)),
                });
            }
            Ok(())
        }
    }
}
