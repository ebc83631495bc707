//! IGnet node transfer core.
//! No sockets: the host reactor moves bytes in and out of each session's
//! buffered channels and calls back into the [`Protocol`] it drives.

pub mod blob;
pub mod channel;
pub mod context;
pub mod node;
pub mod notify;
pub mod registry;
pub mod spool;
pub mod state;
pub mod wire;

pub use blob::{BlobTransfer, Direction};
pub use channel::{BufferedChannel, ChunkRead, ChunkWrite};
pub use context::{Entry, IoContext, PeerAddr, Protocol};
pub use node::{NodeConfig, NodeSession, SessionEnv, Timeouts, DEFAULT_PORT};
pub use notify::{AdminNotice, MemoryNotifier, Notifier};
pub use registry::{TalkingGuard, TalkingTo};
pub use spool::{SpoolDirs, SpoolError};
pub use state::{NextState, ReadState};
pub use wire::{Command, Status, StatusClass};
