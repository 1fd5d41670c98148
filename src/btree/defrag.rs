//! Ghost reclamation.

use log::debug;

use crate::{
    buffer::PageGuard,
    log::record::{LogRecord, LogRecordKind},
    sync::qsx::LatchMode,
    transaction::SysXct,
    types::DbResult,
    Database,
};

use super::apply::{self, PageRole};

/// Rebuild the EX-latched page without its ghost records, as a single-log
/// system transaction. Returns the number of slots reclaimed.
pub fn defrag_page(page: &PageGuard) -> DbResult<usize> {
    debug_assert_eq!(page.mode(), LatchMode::X);
    let ghosts = (1..=page.page().nrecs())
        .filter(|s| page.page().is_ghost(*s))
        .count();
    if ghosts == 0 {
        return Ok(0);
    }
    if page.page().is_node() {
        Database::buffer_pool().unswizzle_children_of(page);
    }
    let sxs = SysXct::begin(true)?;
    let mut rec = LogRecord::new(LogRecordKind::DefragPage, 0, page.pid());
    rec.page_prev_lsn = page.page().page_lsn();
    let lsn = Database::xct_manager().log_insert(sxs.id(), rec.clone())?;
    rec.lsn = lsn;
    apply::apply_to_page(&rec, page.page_mut(), PageRole::Primary)?;
    page.update_lsn_and_dirty(lsn);
    sxs.commit()?;
    debug!("defragged page {}: {} ghosts reclaimed", page.pid(), ghosts);
    Ok(ghosts)
}
