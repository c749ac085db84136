use crate::qp::QpState;

pub type Result<T> = std::result::Result<T, IblinkError>;

/// Opaque platform error code reported by the driver on failure.
///
/// The crate surfaces the code but never interprets it; `None` means the
/// driver reported failure without a code (the mock driver always does).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub Option<i32>);

impl Errno {
    pub fn last_os_error() -> Self {
        Self(std::io::Error::last_os_error().raw_os_error())
    }

    pub const fn none() -> Self {
        Self(None)
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(code) => write!(f, "errno {code}"),
            None => f.write_str("no error code"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IblinkError {
    #[error("device enumeration failed ({errno})")]
    DeviceEnumerationFailed { errno: Errno },

    #[error("no RDMA device matched {query}")]
    DeviceNotFound { query: String },

    #[error("failed to open device '{device}' ({errno})")]
    DeviceOpenFailed { device: String, errno: Errno },

    #[error("device capability query failed ({errno})")]
    CapabilityQueryFailed { errno: Errno },

    #[error("failed to query port {port} ({errno})")]
    PortQueryFailed { port: u8, errno: Errno },

    #[error("port {port} physical state is {state}, not link-up")]
    PortNotReady { port: u8, state: String },

    #[error("protection domain allocation failed ({errno})")]
    ProtectionDomainAllocationFailed { errno: Errno },

    #[error("completion queue creation failed for {capacity} entries ({errno})")]
    CompletionQueueAllocationFailed { capacity: u32, errno: Errno },

    #[error("failed to allocate {size} byte buffer")]
    MemoryAllocationFailed { size: usize },

    #[error("memory registration failed for {size} bytes, access 0x{access:x} ({errno})")]
    MemoryRegistrationFailed {
        size: usize,
        access: u32,
        errno: Errno,
    },

    #[error("queue pair creation failed ({errno})")]
    QueuePairCreateFailed { errno: Errno },

    #[error("queue pair transition to INIT failed from {from} ({errno})")]
    QpInitTransitionFailed { from: QpState, errno: Errno },

    #[error("queue pair transition to RTR failed from {from} ({errno})")]
    QpRtrTransitionFailed { from: QpState, errno: Errno },

    #[error("queue pair transition to RTS failed from {from} ({errno})")]
    QpRtsTransitionFailed { from: QpState, errno: Errno },

    #[error("failed to post receive request in state {state} ({errno})")]
    ReceivePostFailed { state: QpState, errno: Errno },

    #[error("control channel write failed: {reason}")]
    ControlChannelWriteFailed { reason: String },

    #[error("control channel read failed: {reason}")]
    ControlChannelReadFailed { reason: String },

    #[error("control channel closed after {received} of {expected} bytes")]
    ControlChannelClosed { received: usize, expected: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_not_found_display() {
        let e = IblinkError::DeviceNotFound {
            query: "name 'mlx5_9'".into(),
        };
        assert_eq!(e.to_string(), "no RDMA device matched name 'mlx5_9'");
    }

    #[test]
    fn errno_display() {
        assert_eq!(Errno(Some(19)).to_string(), "errno 19");
        assert_eq!(Errno::none().to_string(), "no error code");
    }

    #[test]
    fn channel_closed_display() {
        let e = IblinkError::ControlChannelClosed {
            received: 7,
            expected: 18,
        };
        assert_eq!(
            e.to_string(),
            "control channel closed after 7 of 18 bytes"
        );
    }

    #[test]
    fn transition_failure_names_origin_state() {
        let e = IblinkError::QpRtrTransitionFailed {
            from: QpState::Reset,
            errno: Errno::none(),
        };
        assert!(e.to_string().contains("RTR"));
        assert!(e.to_string().contains("RESET"));
    }
}
