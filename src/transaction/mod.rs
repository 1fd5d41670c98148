pub mod manager;
pub mod recovery;
pub mod tx;

pub use manager::{current_user_xct, current_xct, SysXct, TransactionManager};
pub use tx::{Transaction, Xct, XctState};
