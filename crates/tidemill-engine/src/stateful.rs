//! Stateful partition processing
//!
//! Bridges partitioned batch data and the versioned state store: each
//! partition's records are handed to a caller-supplied function together
//! with the partition's [`StateStore`] opened at `new_version - 1`. The
//! function must commit the store to `new_version` before returning; a
//! partition whose store ends up anywhere else fails the whole operation.

use std::future::Future;

use tidemill_core::Record;
use tidemill_state::{StateStore, StateStoreManager};

use crate::error::{Error, Result};

/// Run `f` over every partition with its state store.
///
/// `f` receives the store opened at the previous version and the partition's
/// input records, and returns its output records together with the version
/// it committed. The outputs are returned in partition order.
pub async fn map_partitions_with_state<F, Fut>(
    partitions: Vec<Vec<Record>>,
    manager: &StateStoreManager,
    operator_id: u64,
    new_version: u64,
    f: F,
) -> Result<Vec<Vec<Record>>>
where
    F: Fn(StateStore, Vec<Record>) -> Fut,
    Fut: Future<Output = Result<(Vec<Record>, u64)>>,
{
    if new_version == 0 {
        return Err(Error::InvalidStateVersion(0));
    }

    let mut outputs = Vec::with_capacity(partitions.len());
    for (partition_id, records) in partitions.into_iter().enumerate() {
        let partition_id = partition_id as u32;
        let store = manager
            .get_store(operator_id, partition_id, new_version - 1)
            .await?;
        let (produced, committed) = f(store, records).await?;
        if committed != new_version {
            return Err(Error::StoreNotCommitted {
                operator_id,
                partition_id,
                expected: new_version,
                actual: committed,
            });
        }
        outputs.push(produced);
    }
    Ok(outputs)
}
