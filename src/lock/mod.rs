pub mod dreadlocks;
pub mod id;
pub mod manager;
pub mod mode;

pub use dreadlocks::Fingerprint;
pub use id::{hash_key, value_partition, LockId, LockLevel};
pub use manager::{LockManager, WaitPolicy};
pub use mode::{IntentMode, LockBase, OkvlMode, OKVL_PARTITIONS};
