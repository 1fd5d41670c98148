pub mod list;
pub mod markable;
pub mod qsx;
pub mod queue;

pub use list::LockFreeList;
pub use markable::{MarkablePointer, StampedPointer};
pub use qsx::{LatchMode, QsxLatch, Ticket};
pub use queue::LockFreeQueue;
