//! Queue pair lifecycle: creation and the three-phase state machine.
//!
//! A reliable-connection queue pair starts in RESET and is driven
//! RESET → INIT → RTR → RTS, each transition applying only its own
//! attribute subset. There are no backward transitions: a failed
//! transition leaves the queue pair unusable and the whole endpoint is
//! torn down rather than retried in place.

use crate::error::{Errno, IblinkError, Result};
use crate::resources::{CompletionQueue, MemoryRegion, ProtectionDomain};
use crate::verbs::{InitAttr, QpHandle, QueueCaps, RtrAttr, RtsAttr, Verbs};
use std::sync::Arc;

/// Lifecycle state of a queue pair, as tracked by this wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
}

impl std::fmt::Display for QpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QpState::Reset => f.write_str("RESET"),
            QpState::Init => f.write_str("INIT"),
            QpState::ReadyToReceive => f.write_str("RTR"),
            QpState::ReadyToSend => f.write_str("RTS"),
        }
    }
}

/// A reliable-connection queue pair bound to one completion queue.
pub struct QueuePair {
    driver: Arc<dyn Verbs>,
    handle: QpHandle,
    qp_num: u32,
    state: QpState,
}

impl QueuePair {
    /// Create a queue pair in RESET state with both work queues bound to `cq`.
    pub fn create(pd: &ProtectionDomain, cq: &CompletionQueue, caps: &QueueCaps) -> Result<Self> {
        let created = pd.driver().create_qp(pd.handle(), cq.handle(), caps)?;
        tracing::debug!(
            qp_num = format_args!("0x{:x}", created.qp_num),
            "queue pair created"
        );
        Ok(Self {
            driver: Arc::clone(pd.driver()),
            handle: created.handle,
            qp_num: created.qp_num,
            state: QpState::Reset,
        })
    }

    /// Number unique within the device; part of the wire identity.
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    pub fn state(&self) -> QpState {
        self.state
    }

    /// RESET → INIT. Needs only local attributes: port, partition key
    /// index, and the access flags matching the memory region's.
    pub fn to_init(&mut self, attr: &InitAttr) -> Result<()> {
        if self.state != QpState::Reset {
            return Err(IblinkError::QpInitTransitionFailed {
                from: self.state,
                errno: Errno::none(),
            });
        }
        self.driver.modify_qp_init(self.handle, attr)?;
        self.state = QpState::Init;
        Ok(())
    }

    /// INIT → RTR. Cannot succeed before the rendezvous has produced the
    /// peer's identity: `attr` carries the remote queue pair number and
    /// remote link identifier.
    pub fn to_rtr(&mut self, attr: &RtrAttr) -> Result<()> {
        if self.state != QpState::Init {
            return Err(IblinkError::QpRtrTransitionFailed {
                from: self.state,
                errno: Errno::none(),
            });
        }
        self.driver.modify_qp_rtr(self.handle, attr)?;
        self.state = QpState::ReadyToReceive;
        Ok(())
    }

    /// RTR → RTS, the terminal state for bring-up.
    pub fn to_rts(&mut self, attr: &RtsAttr) -> Result<()> {
        if self.state != QpState::ReadyToReceive {
            return Err(IblinkError::QpRtsTransitionFailed {
                from: self.state,
                errno: Errno::none(),
            });
        }
        self.driver.modify_qp_rts(self.handle, attr)?;
        self.state = QpState::ReadyToSend;
        Ok(())
    }

    /// Post one receive work request covering the registered buffer.
    ///
    /// A queue pair accepts receives from INIT onward; the responder side
    /// must have one posted before it reaches RTS, or the peer's first
    /// send has nowhere to land.
    pub fn post_receive(&self, mr: &MemoryRegion) -> Result<()> {
        if self.state == QpState::Reset {
            return Err(IblinkError::ReceivePostFailed {
                state: self.state,
                errno: Errno::none(),
            });
        }
        self.driver
            .post_receive(self.handle, mr.addr(), mr.len() as u32, mr.lkey(), self.state)
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        self.driver.destroy_qp(self.handle);
    }
}
