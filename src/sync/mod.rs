//! Synchronization for the preemptive regime: pool workers and raw threads.
//!
//! Nothing in here suspends cooperatively. [`Lock::acquire`] blocks the OS
//! thread, so tasks on a scheduler thread should hand such work to a
//! [`ThreadPool`](crate::ThreadPool) instead.

mod counter;
mod lock;
mod wait_graph;

pub use counter::SharedCounter;
pub use lock::{ContextId, Lock, LockGuard, LockId};
pub use wait_graph::{LockOrderingHazard, WaitEdge, WaitGraph, WaitGraphSnapshot};
