use std::sync::{Arc, RwLock};

use crate::error::DbError;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type DbResult<T = ()> = Result<T, DbError>;

/// 32-bit page identifier. The high bit is reserved for the swizzle flag,
/// see `buffer::swizzle`.
pub type PageId = u32;

/// A B+Tree is identified by its store id within the volume.
pub type StoreId = u32;

pub type VolumeId = u16;

pub type TransactionId = u32;

pub const INVALID_PAGE_ID: PageId = 0;
