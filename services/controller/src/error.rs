//! Errors returned by a reconciliation pass.
//!
//! Backend failures during convergence are not errors here: they end up in
//! the resource status. A pass only fails when the store rejected a write or
//! a teardown could not complete; the work queue retries both.

use thiserror::Error;

use crate::inventory::InventoryError;
use crate::resource::GroupKey;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("teardown of {key} failed: {source}")]
    Teardown {
        key: GroupKey,
        #[source]
        source: InventoryError,
    },
}
