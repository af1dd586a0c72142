//! Connection factories shipped with agentmesh.
//!
//! - [`TcpConnector`]: dials every protocol variant over plain TCP and frames
//!   outgoing messages as `[4-byte length prefix as u32 big-endian] + [payload]`
//! - `MockConnector` (feature `test-util`): scriptable in-memory connector

pub mod tcp;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use tcp::{TcpConnection, TcpConnector};

#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockBehavior, MockConnection, MockConnector};
