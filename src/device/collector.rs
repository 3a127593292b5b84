use std::sync::Arc;

use tracing::info;

use super::connector::connect_concurrently;
use super::{ConnectOptions, Connectable};
use crate::error::AppResult;

/// Name and connect several top-level devices concurrently.
///
/// Each device is named after its key, unless it already has a name. Failures
/// are aggregated exactly as for the children of one device.
pub async fn connect_all(
    devices: &[(&str, Arc<dyn Connectable>)],
    options: ConnectOptions,
) -> AppResult<()> {
    for (name, device) in devices {
        if device.name().is_empty() {
            device.set_name(name);
        }
    }
    connect_concurrently(
        devices.iter().map(|(name, device)| (*name, device.as_ref())),
        options,
    )
    .await?;
    info!(devices = devices.len(), "all devices connected");
    Ok(())
}
