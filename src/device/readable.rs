//! Aggregated readout of a device's signals.
//!
//! A [`Readout`] is a table of readables, each registered in one
//! [`ReadableFormat`]. `read`/`describe` merge the maps of every `Read`,
//! `HintedRead` and `Child` entry; `read_configuration` and
//! `describe_configuration` merge the `Config` entries plus the
//! configuration of every `Child`. Values of different types are merged as
//! JSON readings.
//!
//! [`StandardReadable`] is a [`Device`] whose children are registered in a
//! readout as they are attached.
//!
//! ```rust,ignore
//! let motor = StandardReadable::builder()
//!     .readable("readback", Arc::new(Signal::soft_rw(0.0f64)), ReadableFormat::HintedRead)
//!     .readable("velocity", Arc::new(Signal::soft_rw(1.0f64)), ReadableFormat::Config)
//!     .build("x")?;
//! let readings = motor.read().await?;            // {"x.readback": ...}
//! let config = motor.read_configuration().await?; // {"x.velocity": ...}
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture};
use serde::Serialize;
use serde_json::Value;

use super::{impl_connectable_via_device, Connectable, Device, DeviceBuilder};
use crate::error::{AppResult, DaqError};
use crate::signal::{DataKey, Reading, Signal, SignalValue};

/// Readings keyed by full signal name.
pub type ReadingMap = BTreeMap<String, Reading<Value>>;

/// Data keys keyed by full signal name.
pub type DataKeyMap = BTreeMap<String, DataKey>;

/// Anything that contributes to a device readout.
#[async_trait]
pub trait Readable: Send + Sync + 'static {
    /// Current readings.
    async fn read(&self) -> AppResult<ReadingMap>;

    /// Static description of what `read` returns.
    async fn describe(&self) -> AppResult<DataKeyMap>;

    /// Readings that only change between acquisitions.
    async fn read_configuration(&self) -> AppResult<ReadingMap> {
        Ok(BTreeMap::new())
    }

    /// Description of `read_configuration`.
    async fn describe_configuration(&self) -> AppResult<DataKeyMap> {
        Ok(BTreeMap::new())
    }

    /// Field names worth showing by default.
    fn hint_fields(&self) -> Vec<String>;
}

#[async_trait]
impl<T: SignalValue> Readable for Signal<T> {
    async fn read(&self) -> AppResult<ReadingMap> {
        let reading = self.get_reading().await?;
        let value = serde_json::to_value(&reading.value).map_err(|e| DaqError::TypeMismatch {
            signal: self.name(),
            expected: T::TYPE_NAME,
            message: e.to_string(),
        })?;
        let reading = Reading {
            value,
            timestamp: reading.timestamp,
            alarm_severity: reading.alarm_severity,
        };
        Ok(BTreeMap::from([(self.name(), reading)]))
    }

    async fn describe(&self) -> AppResult<DataKeyMap> {
        Signal::describe(self).await
    }

    fn hint_fields(&self) -> Vec<String> {
        vec![self.name()]
    }
}

/// Role of one readable within a readout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadableFormat {
    /// Read every event
    Read,
    /// Read every event and listed in the hints
    HintedRead,
    /// Read once per acquisition as configuration
    Config,
    /// A readable device contributing its own readout and hints
    Child,
}

/// Table of readables merged into one readout.
#[derive(Clone, Default)]
pub struct Readout {
    entries: Vec<(ReadableFormat, Arc<dyn Readable>)>,
}

impl Readout {
    /// Empty readout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `readable` in `format`.
    pub fn add(&mut self, format: ReadableFormat, readable: Arc<dyn Readable>) {
        self.entries.push((format, readable));
    }

    /// Builder form of [`add`](Self::add).
    pub fn with(mut self, format: ReadableFormat, readable: Arc<dyn Readable>) -> Self {
        self.add(format, readable);
        self
    }

    /// Number of registered readables.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merged readings of the per-event entries.
    pub async fn read(&self) -> AppResult<ReadingMap> {
        merge(self.per_event(|r| r.read())).await
    }

    /// Merged description of the per-event entries.
    pub async fn describe(&self) -> AppResult<DataKeyMap> {
        merge(self.per_event(|r| r.describe())).await
    }

    /// Merged configuration readings.
    pub async fn read_configuration(&self) -> AppResult<ReadingMap> {
        merge(self.configuration(|r| r.read(), |r| r.read_configuration())).await
    }

    /// Merged configuration description.
    pub async fn describe_configuration(&self) -> AppResult<DataKeyMap> {
        merge(self.configuration(|r| r.describe(), |r| r.describe_configuration())).await
    }

    /// Hinted field names, including those of child devices.
    pub fn hints(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(format, _)| {
                matches!(format, ReadableFormat::HintedRead | ReadableFormat::Child)
            })
            .flat_map(|(_, readable)| readable.hint_fields())
            .collect()
    }

    fn per_event<'a, V>(
        &'a self,
        op: impl Fn(&'a Arc<dyn Readable>) -> BoxFuture<'a, AppResult<V>>,
    ) -> Vec<BoxFuture<'a, AppResult<V>>> {
        self.entries
            .iter()
            .filter(|(format, _)| *format != ReadableFormat::Config)
            .map(|(_, readable)| op(readable))
            .collect()
    }

    fn configuration<'a, V>(
        &'a self,
        own: impl Fn(&'a Arc<dyn Readable>) -> BoxFuture<'a, AppResult<V>>,
        child: impl Fn(&'a Arc<dyn Readable>) -> BoxFuture<'a, AppResult<V>>,
    ) -> Vec<BoxFuture<'a, AppResult<V>>> {
        self.entries
            .iter()
            .filter_map(|(format, readable)| match format {
                ReadableFormat::Config => Some(own(readable)),
                ReadableFormat::Child => Some(child(readable)),
                _ => None,
            })
            .collect()
    }
}

impl std::fmt::Debug for Readout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let formats: Vec<ReadableFormat> = self.entries.iter().map(|(format, _)| *format).collect();
        f.debug_struct("Readout").field("entries", &formats).finish()
    }
}

/// Run `parts` concurrently and merge their maps. Keys must be unique.
async fn merge<V>(
    parts: Vec<BoxFuture<'_, AppResult<BTreeMap<String, V>>>>,
) -> AppResult<BTreeMap<String, V>> {
    let mut merged = BTreeMap::new();
    for part in try_join_all(parts).await? {
        for (key, value) in part {
            if merged.contains_key(&key) {
                return Err(DaqError::Configuration(format!(
                    "'{key}' appears twice in one readout"
                )));
            }
            merged.insert(key, value);
        }
    }
    Ok(merged)
}

/// Device whose children are registered in a [`Readout`].
#[derive(Debug)]
pub struct StandardReadable {
    device: Device,
    readout: Readout,
}

impl StandardReadable {
    /// Start building a readable device.
    pub fn builder() -> StandardReadableBuilder {
        StandardReadableBuilder::default()
    }

    /// The underlying device tree.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The readout table.
    pub fn readout(&self) -> &Readout {
        &self.readout
    }
}

#[async_trait]
impl Readable for StandardReadable {
    async fn read(&self) -> AppResult<ReadingMap> {
        self.readout.read().await
    }

    async fn describe(&self) -> AppResult<DataKeyMap> {
        self.readout.describe().await
    }

    async fn read_configuration(&self) -> AppResult<ReadingMap> {
        self.readout.read_configuration().await
    }

    async fn describe_configuration(&self) -> AppResult<DataKeyMap> {
        self.readout.describe_configuration().await
    }

    fn hint_fields(&self) -> Vec<String> {
        self.readout.hints()
    }
}

impl_connectable_via_device!(StandardReadable, device);

/// Builds a [`StandardReadable`].
#[derive(Default)]
pub struct StandardReadableBuilder {
    device: DeviceBuilder,
    readout: Readout,
}

impl StandardReadableBuilder {
    /// Attach `node` as child `name` and register it in `format`.
    pub fn readable<R>(mut self, name: impl Into<String>, node: Arc<R>, format: ReadableFormat) -> Self
    where
        R: Readable + Connectable,
    {
        let readable: Arc<dyn Readable> = node.clone();
        self.readout.add(format, readable);
        self.device = self.device.child(name, node);
        self
    }

    /// Attach `node` without adding it to the readout.
    pub fn child(mut self, name: impl Into<String>, node: Arc<dyn Connectable>) -> Self {
        self.device = self.device.child(name, node);
        self
    }

    /// Build the device named `name`.
    pub fn build(self, name: &str) -> AppResult<StandardReadable> {
        Ok(StandardReadable {
            device: self.device.build(name)?,
            readout: self.readout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectOptions;
    use crate::signal::SignalMetadata;

    fn motor() -> StandardReadable {
        StandardReadable::builder()
            .readable(
                "readback",
                Arc::new(Signal::soft_rw_with(1.5f64, SignalMetadata::with_units("mm"))),
                ReadableFormat::HintedRead,
            )
            .readable("moving", Arc::new(Signal::soft_rw(false)), ReadableFormat::Read)
            .readable(
                "velocity",
                Arc::new(Signal::soft_rw(2.0f64)),
                ReadableFormat::Config,
            )
            .readable(
                "units",
                Arc::new(Signal::soft_rw("mm".to_string())),
                ReadableFormat::Config,
            )
            .child("setpoint", Arc::new(Signal::soft_rw(0.0f64)))
            .build("x")
            .unwrap()
    }

    #[tokio::test]
    async fn read_and_configuration_are_split() {
        let motor = motor();
        let read = motor.read().await.unwrap();
        assert_eq!(
            read.keys().collect::<Vec<_>>(),
            vec!["x.moving", "x.readback"]
        );
        assert_eq!(read["x.readback"].value, serde_json::json!(1.5));
        assert_eq!(read["x.moving"].value, serde_json::json!(false));

        let config = motor.read_configuration().await.unwrap();
        assert_eq!(config.len(), 2);
        assert_eq!(config["x.units"].value, serde_json::json!("mm"));

        let describe = motor.describe().await.unwrap();
        assert_eq!(describe["x.readback"].units.as_deref(), Some("mm"));
        assert!(!describe.contains_key("x.setpoint"));
        let config_keys = motor.describe_configuration().await.unwrap();
        assert_eq!(config_keys["x.velocity"].source, "soft://x.velocity");
        assert_eq!(motor.hint_fields(), vec!["x.readback"]);
    }

    #[tokio::test]
    async fn nested_readables_contribute_everything() {
        let stage = StandardReadable::builder()
            .readable("x", Arc::new(motor()), ReadableFormat::Child)
            .readable(
                "temperature",
                Arc::new(Signal::soft_rw(21.0f64)),
                ReadableFormat::HintedRead,
            )
            .build("stage")
            .unwrap();
        stage.connect(ConnectOptions::mock()).await.unwrap();

        let read = stage.read().await.unwrap();
        assert_eq!(
            read.keys().collect::<Vec<_>>(),
            vec!["stage.temperature", "stage.x.moving", "stage.x.readback"]
        );
        let config = stage.read_configuration().await.unwrap();
        assert!(config.contains_key("stage.x.velocity"));
        assert_eq!(
            stage.hint_fields(),
            vec!["stage.x.readback", "stage.temperature"]
        );
    }

    #[tokio::test]
    async fn duplicate_keys_are_refused() {
        let signal = Arc::new(Signal::soft_rw(1i32));
        signal.set_name("dup");
        let readout = Readout::new()
            .with(ReadableFormat::Read, signal.clone())
            .with(ReadableFormat::Read, signal);
        assert!(matches!(
            readout.read().await,
            Err(DaqError::Configuration(_))
        ));
    }
}
