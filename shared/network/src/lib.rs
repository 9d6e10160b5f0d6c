mod collective;
mod fabric;
mod mem;
mod message;
mod tcp;
mod wire;

pub use collective::{bcast, Mailbox};
pub use fabric::{Fabric, FabricError};
pub use mem::{mem_fabric, MemFabric};
pub use message::{
    BorderUpdate, Message, Strip, TaskInit, TerminationReason, UpdateRecord, WorkerFailure,
    WorkerReport, WorkerStatus,
};
pub use tcp::{TcpFabric, TcpRoot};
pub use wire::Wire;
