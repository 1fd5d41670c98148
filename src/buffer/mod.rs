pub mod cleaner;
pub mod frame;
pub mod hashtable;
pub mod pool;

pub use cleaner::PageCleaner;
pub use frame::ControlBlock;
pub use pool::{is_swizzled, swizzle, swizzled_idx, BufferPool, PageGuard};
