use serde_json::Value;

use super::{min_synced, SyncParams, SyncReplica, SyncSource};
use crate::error::Result;

/// Finds the newest version both sides agree on.
///
/// Returns `None` when either side is empty, and the older of both first
/// versions when the sides diverge from their first rows on. Otherwise the
/// common prefix of both version-ordered row lists is narrowed by bisection
/// over `end_offset` lookups.
///
/// Two sides with the same row count and the same newest row are taken to
/// agree without looking at the rows in between. A side that differs only
/// in the middle (another row id under a shared version) is not detected
/// here; such rows are only exchanged once one of them changes again.
///
/// # Errors
///
/// Errors of either side.
pub async fn find_watermark(
    source: &dyn SyncSource,
    replica: &dyn SyncReplica,
    params: &SyncParams,
) -> Result<Option<Value>> {
    let server = source.info(None, None).await?;
    let client = replica.info(None, None).await?;
    if server.count == 0 || client.count == 0 {
        return Ok(None);
    }

    let (Some(s_first), Some(c_first)) = (&server.first, &client.first) else {
        return Ok(None);
    };
    if let (Some(s_last), Some(c_last)) = (&server.last, &client.last) {
        if server.count == client.count && params.same_version(s_last, c_last) {
            tracing::trace!("sync sides already agree");
            return Ok(params.synced(s_last).cloned());
        }
    }
    if !params.same_version(s_first, c_first) {
        return Ok(min_synced(params.synced(s_first), params.synced(c_first)));
    }

    let mut matched = s_first.clone();
    let mut lo = 0u64;
    let mut hi = server.count.min(client.count) - 1;
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        let s_row = source.info(None, Some(mid)).await?.last;
        let c_row = replica.info(None, Some(mid)).await?.last;
        match (s_row, c_row) {
            (Some(s_row), Some(c_row)) if params.same_version(&s_row, &c_row) => {
                matched = s_row;
                lo = mid;
            }
            _ => hi = mid - 1,
        }
    }
    tracing::trace!(offset = lo, "sync watermark narrowed");
    Ok(params.synced(&matched).cloned())
}
