use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{ConnectOptions, Connectable, Device};
use crate::error::AppResult;

/// Device whose children are indexed by integer, e.g. detector channels.
///
/// Children are named by their index, so element 3 of `det.channel` is
/// `det.channel.3`.
pub struct DeviceVector<D: Connectable> {
    device: Device,
    items: BTreeMap<usize, Arc<D>>,
}

impl<D: Connectable> DeviceVector<D> {
    /// Build from `(index, child)` pairs.
    pub fn new(items: impl IntoIterator<Item = (usize, Arc<D>)>) -> AppResult<Self> {
        let device = Device::new("");
        let items: BTreeMap<usize, Arc<D>> = items.into_iter().collect();
        for (index, item) in &items {
            let node: Arc<dyn Connectable> = item.clone();
            device.attach(&index.to_string(), node)?;
        }
        Ok(Self { device, items })
    }

    /// Element at `index`.
    pub fn get(&self, index: usize) -> Option<&Arc<D>> {
        self.items.get(&index)
    }

    /// Elements in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<D>)> {
        self.items.iter().map(|(i, d)| (*i, d))
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl<D: Connectable> Connectable for DeviceVector<D> {
    fn name(&self) -> String {
        self.device.name()
    }

    fn set_name(&self, name: &str) {
        self.device.set_name(name)
    }

    async fn connect(&self, options: ConnectOptions) -> AppResult<()> {
        self.device.connect(options).await
    }

    fn is_connected(&self) -> bool {
        self.device.is_connected()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;

    #[tokio::test]
    async fn elements_named_by_index() {
        let channels = DeviceVector::new(
            [1usize, 2, 5]
                .into_iter()
                .map(|i| (i, Arc::new(Signal::soft_rw(i as f64)))),
        )
        .unwrap();
        let parent = Device::builder()
            .child("channel", Arc::new(channels))
            .build("det")
            .unwrap();
        parent.connect(ConnectOptions::mock()).await.unwrap();

        let channels: Arc<DeviceVector<Signal<f64>>> = parent.child("channel").unwrap();
        assert_eq!(channels.len(), 3);
        let five = channels.get(5).unwrap();
        assert_eq!(five.name(), "det.channel.5");
        assert_eq!(five.get_value().await.unwrap(), 5.0);
        assert!(channels.get(3).is_none());
    }
}
