//! RDMA reliable-connection endpoint bring-up.
//!
//! This crate takes two peers from "device discovered" to "ready to
//! transfer": it allocates the hardware resource chain (context →
//! protection domain → completion queue → memory region → queue pair),
//! exchanges endpoint identities over an out-of-band control channel, and
//! drives the queue pair through INIT → RTR → RTS. Its responsibility ends
//! at a queue pair in RTS state; posting data-plane work and polling
//! completions belong to the next layer.
//!
//! # Architecture
//!
//! - [`verbs`] — the hardware/driver boundary as a trait, with a real
//!   libibverbs driver (`real-rdma` feature) and an instrumented mock
//!   (`mock-rdma`, default) so everything below compiles and tests without
//!   hardware.
//! - [`device`] — enumeration and selection by index or name.
//! - [`resources`] — scoped-ownership wrappers; each handle is released in
//!   `Drop`, so partial failures unwind in reverse creation order.
//! - [`qp`] — the queue pair state machine with per-transition attribute
//!   subsets.
//! - [`wire`] / [`channel`] — the fixed 18-byte network-order identity
//!   record and the blocking rendezvous that swaps it between peers.
//! - [`endpoint`] — the orchestrator composing all of the above.
//!
//! # Usage
//!
//! ```ignore
//! use iblink::{BringupConfig, Endpoint, Role};
//! use iblink::verbs::sys::SysVerbs;
//! use std::net::TcpStream;
//! use std::sync::Arc;
//!
//! let mut channel = TcpStream::connect("10.0.0.2:18515")?;
//! let config = BringupConfig {
//!     role: Role::Responder,
//!     ..BringupConfig::from_env()
//! };
//! let endpoint = Endpoint::bring_up(Arc::new(SysVerbs::new()), &config, &mut channel)?;
//! println!("peer identity: {}", endpoint.remote_identity());
//! ```

pub mod channel;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod qp;
pub mod resources;
pub mod types;
pub mod verbs;
pub mod wire;

pub use device::DeviceQuery;
pub use endpoint::{BringupConfig, Endpoint, Role};
pub use error::{Errno, IblinkError, Result};
pub use qp::{QpState, QueuePair};
pub use resources::{CompletionQueue, DeviceContext, MemoryRegion, ProtectionDomain};
pub use types::{AccessFlags, LinkLayer, Mtu, PortPhysicalState, PortState, Transport};
pub use verbs::{DeviceCaps, DeviceDescriptor, PortInfo, QueueCaps, Verbs};
pub use wire::{EndpointIdentity, WIRE_SIZE};
