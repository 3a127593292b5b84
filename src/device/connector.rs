//! Child discovery and concurrent connection.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::timeout_at;
use tracing::warn;

use super::{ConnectOptions, Connectable, Device};
use crate::error::{AppResult, ConnectErrors, DaqError};

/// Strategy that knows how to populate and connect a device's children.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Make sure every child exists before it is enumerated.
    fn create_children(&self, device: &Device) -> AppResult<()>;

    /// Connect every child of `device`.
    async fn connect(&self, device: &Device, options: ConnectOptions) -> AppResult<()> {
        self.create_children(device)?;
        connect_children(device, options).await
    }
}

/// Connector for devices whose children are attached at construction.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

impl DeviceConnector for DefaultConnector {
    fn create_children(&self, _device: &Device) -> AppResult<()> {
        Ok(())
    }
}

/// Factory building one child on demand.
pub type ChildFactory = Arc<dyn Fn() -> Arc<dyn Connectable> + Send + Sync>;

struct ChildSlot {
    name: String,
    factory: ChildFactory,
}

/// Connector driven by an explicit table of named child slots.
///
/// Each slot is instantiated the first time the device connects, unless a
/// child of that name was already attached. A composite child is built by a
/// factory returning a [`Device`] with its own connector, which fills its
/// own slots when it connects in turn.
///
/// ```rust,ignore
/// let connector = SchemaConnector::new()
///     .slot("readback", || Arc::new(Signal::<f64>::live_r(transport.clone(), "M:RBV")))
///     .slot("velocity", || Arc::new(Signal::<f64>::live_rw(transport.clone(), "M:VELO", "M:VELO")));
/// let motor = Device::with_connector("motor", Arc::new(connector));
/// ```
#[derive(Default)]
pub struct SchemaConnector {
    slots: Vec<ChildSlot>,
}

impl SchemaConnector {
    /// Connector with no slots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a child slot.
    pub fn slot<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Connectable> + Send + Sync + 'static,
    {
        self.slots.push(ChildSlot {
            name: name.into(),
            factory: Arc::new(factory),
        });
        self
    }

    /// Names of the declared slots, in declaration order.
    pub fn slot_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name.as_str()).collect()
    }
}

impl DeviceConnector for SchemaConnector {
    fn create_children(&self, device: &Device) -> AppResult<()> {
        for slot in &self.slots {
            if device.child_node(&slot.name).is_none() {
                device.attach(&slot.name, (slot.factory)())?;
            }
        }
        Ok(())
    }
}

/// Connect every child of `device` concurrently under one deadline.
///
/// Every child starts connecting before any is awaited. All failures are
/// collected; children that succeeded stay connected.
pub async fn connect_children(device: &Device, options: ConnectOptions) -> AppResult<()> {
    let children = device.children();
    connect_concurrently(
        children
            .iter()
            .map(|(name, child)| (name.as_str(), child.as_ref())),
        options,
    )
    .await
}

pub(crate) async fn connect_concurrently<'a, I>(nodes: I, options: ConnectOptions) -> AppResult<()>
where
    I: IntoIterator<Item = (&'a str, &'a dyn Connectable)>,
{
    let options = options.with_deadline();
    let deadline = options.deadline();
    let attempts = nodes.into_iter().map(|(name, node)| async move {
        let outcome = match timeout_at(deadline, node.connect(options)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DaqError::ConnectionTimeout {
                endpoint: node.name(),
                timeout: options.timeout,
            }),
        };
        (name, outcome)
    });

    let mut errors = ConnectErrors::new();
    for (name, outcome) in join_all(attempts).await {
        if let Err(e) = outcome {
            if !matches!(e, DaqError::NotConnected(_)) {
                warn!(child = name, error = %e, "child failed to connect");
            }
            errors.insert(name, e);
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(DaqError::NotConnected(errors))
    }
}
