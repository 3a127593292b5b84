//! Data side of an acquisition: open a sink, report progress, describe data.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::documents::StreamAsset;
use crate::error::AppResult;
use crate::signal::DataKey;

/// Opens a data sink and reports how much has been written to it.
///
/// Indices are counted in logical events: frames written divided by the
/// multiplier passed to [`open`](Self::open).
#[async_trait]
pub trait DetectorWriter: Send + Sync {
    /// Open the sink for one acquisition and describe every output field.
    ///
    /// Each data key carries `external` so consumers know the payload is
    /// delivered by documents rather than inline.
    async fn open(&self, multiplier: u64) -> AppResult<BTreeMap<String, DataKey>>;

    /// Stream the written index every time it changes.
    ///
    /// Fails with `WriteStallTimeout` when no progress happens for `timeout`.
    /// Every call returns an independent stream.
    fn observe_indices_written(&self, timeout: Duration) -> BoxStream<'_, AppResult<u64>>;

    /// Written index right now.
    async fn get_indices_written(&self) -> AppResult<u64>;

    /// Documents describing everything written up to `indices_written`.
    ///
    /// Resources come out once per acquisition, then one datum per dataset
    /// for each new index range. Calling again with the same index yields
    /// nothing.
    fn collect_stream_docs(&self, indices_written: u64) -> BoxStream<'_, AppResult<StreamAsset>>;

    /// Stop capturing and wait until the hardware confirms it stopped.
    async fn close(&self) -> AppResult<()>;
}
