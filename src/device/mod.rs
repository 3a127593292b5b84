//! Device trees and their connect protocol.
//!
//! A [`Device`] is a named node owning an ordered set of children, each a
//! [`Signal`](crate::signal::Signal) or another device. Calling
//! [`Device::connect`] connects the whole subtree concurrently:
//!
//! 1. Already connected and not `force_reconnect`: return immediately.
//! 2. The device's [`DeviceConnector`] creates any missing children.
//! 3. Every child connects concurrently under one shared deadline.
//! 4. All failures are collected into [`DaqError::NotConnected`]; the device
//!    is only marked connected when every child succeeded.
//!
//! With `mock` set in [`ConnectOptions`], every leaf signal binds a mock
//! backend instead of its production backend. The tree topology is identical
//! in both modes.
//!
//! # Example
//!
//! ```rust,ignore
//! let stage = Device::builder()
//!     .child("x", Arc::new(Signal::soft_rw(0.0f64)))
//!     .child("y", Arc::new(Signal::soft_rw(0.0f64)))
//!     .build("stage")?;
//! stage.connect(ConnectOptions::mock()).await?;
//! let x: Arc<Signal<f64>> = stage.child("x").unwrap();
//! assert_eq!(x.name(), "stage.x");
//! ```

mod collector;
mod connector;
mod readable;
mod vector;

pub use collector::connect_all;
pub use connector::{connect_children, ChildFactory, DefaultConnector, DeviceConnector, SchemaConnector};
pub use readable::{
    DataKeyMap, Readable, ReadableFormat, Readout, ReadingMap, StandardReadable,
    StandardReadableBuilder,
};
pub use vector::DeviceVector;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_TIMEOUT;
use crate::error::{AppResult, DaqError};

/// Options threaded through one connect of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Bind mock backends instead of production ones
    pub mock: bool,
    /// Time budget for the whole tree
    pub timeout: Duration,
    /// Reconnect even if already connected
    pub force_reconnect: bool,
    deadline: Option<Instant>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            mock: false,
            timeout: DEFAULT_TIMEOUT,
            force_reconnect: false,
            deadline: None,
        }
    }
}

impl ConnectOptions {
    /// Default options with mock backends.
    pub fn mock() -> Self {
        Self {
            mock: true,
            ..Self::default()
        }
    }

    /// Set the time budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.deadline = None;
        self
    }

    /// Set `force_reconnect`.
    pub fn force_reconnect(mut self) -> Self {
        self.force_reconnect = true;
        self
    }

    /// Fix the deadline to `now + timeout` unless one is already set.
    ///
    /// Children receive options with the deadline fixed, so the budget
    /// shrinks as the tree is walked instead of restarting at every level.
    pub fn with_deadline(mut self) -> Self {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.timeout);
        }
        self
    }

    /// Point in time by which the connect must finish.
    pub fn deadline(&self) -> Instant {
        self.deadline
            .unwrap_or_else(|| Instant::now() + self.timeout)
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline()
            .saturating_duration_since(Instant::now())
    }
}

/// A node of a device tree.
#[async_trait]
pub trait Connectable: Send + Sync + 'static {
    /// Dotted path name.
    fn name(&self) -> String;

    /// Set the name, propagating to children.
    fn set_name(&self, name: &str);

    /// Connect this node and everything below it.
    async fn connect(&self, options: ConnectOptions) -> AppResult<()>;

    /// Whether the last connect succeeded.
    fn is_connected(&self) -> bool;

    /// Upcast for typed child lookup.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[derive(Debug, Default)]
struct DeviceState {
    connected: bool,
    previous_mock: Option<bool>,
}

/// Composite node owning named children.
pub struct Device {
    name: RwLock<String>,
    children: RwLock<Vec<(String, Arc<dyn Connectable>)>>,
    connector: Arc<dyn DeviceConnector>,
    state: Mutex<DeviceState>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Device {
    /// Device with no children and the default connector.
    pub fn new(name: &str) -> Self {
        Self::with_connector(name, Arc::new(DefaultConnector))
    }

    /// Device whose children are created by `connector`.
    pub fn with_connector(name: &str, connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            name: RwLock::new(name.to_string()),
            children: RwLock::new(Vec::new()),
            connector,
            state: Mutex::new(DeviceState::default()),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Start building a device from explicit children.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::default()
    }

    /// Dotted path name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Set the name of this device and every descendant.
    pub fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
        for (child_name, child) in self.children() {
            child.set_name(&child_path(name, &child_name));
        }
    }

    /// Attach a child, naming it after this device.
    ///
    /// Children can only be attached to a device that is already built, so
    /// the graph stays a tree.
    pub(crate) fn attach(&self, name: &str, child: Arc<dyn Connectable>) -> AppResult<()> {
        let mut children = self.children.write();
        if children.iter().any(|(existing, _)| existing == name) {
            return Err(DaqError::Configuration(format!(
                "device '{}' already has a child named '{name}'",
                self.name()
            )));
        }
        child.set_name(&child_path(&self.name(), name));
        children.push((name.to_string(), child));
        Ok(())
    }

    /// Children in attachment order.
    pub fn children(&self) -> Vec<(String, Arc<dyn Connectable>)> {
        self.children.read().clone()
    }

    /// Child node by name.
    pub fn child_node(&self, name: &str) -> Option<Arc<dyn Connectable>> {
        self.children
            .read()
            .iter()
            .find(|(child, _)| child == name)
            .map(|(_, node)| node.clone())
    }

    /// Child by name, downcast to its concrete type.
    pub fn child<S: Any + Send + Sync>(&self, name: &str) -> Option<Arc<S>> {
        self.child_node(name)?.into_any().downcast::<S>().ok()
    }

    /// Whether the last connect succeeded for the whole subtree.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Connect every child concurrently.
    pub async fn connect(&self, options: ConnectOptions) -> AppResult<()> {
        let options = options.with_deadline();
        let _guard = self.connect_lock.lock().await;
        {
            let mut state = self.state.lock();
            if let Some(previous) = state.previous_mock {
                if previous != options.mock {
                    return Err(DaqError::MockModeMismatch {
                        requested: options.mock,
                        previous,
                    });
                }
            }
            state.previous_mock = Some(options.mock);
            if state.connected && !options.force_reconnect {
                debug!(device = %self.name(), "already connected");
                return Ok(());
            }
            state.connected = false;
        }

        let result = self.connector.connect(self, options).await;
        self.state.lock().connected = result.is_ok();
        match &result {
            Ok(()) => info!(device = %self.name(), mock = options.mock, "device connected"),
            Err(e) => warn!(device = %self.name(), error = %e, "device failed to connect"),
        }
        result
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let children: Vec<String> = self.children.read().iter().map(|(n, _)| n.clone()).collect();
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("children", &children)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn child_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        String::new()
    } else {
        format!("{parent}.{child}")
    }
}

#[async_trait]
impl Connectable for Device {
    fn name(&self) -> String {
        Device::name(self)
    }

    fn set_name(&self, name: &str) {
        Device::set_name(self, name)
    }

    async fn connect(&self, options: ConnectOptions) -> AppResult<()> {
        Device::connect(self, options).await
    }

    fn is_connected(&self) -> bool {
        Device::is_connected(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Builds a [`Device`] from explicit children.
#[derive(Default)]
pub struct DeviceBuilder {
    children: Vec<(String, Arc<dyn Connectable>)>,
    connector: Option<Arc<dyn DeviceConnector>>,
}

impl DeviceBuilder {
    /// Add a named child.
    pub fn child(mut self, name: impl Into<String>, child: Arc<dyn Connectable>) -> Self {
        self.children.push((name.into(), child));
        self
    }

    /// Use `connector` instead of the default one.
    pub fn connector(mut self, connector: Arc<dyn DeviceConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build the device, naming every child after it.
    pub fn build(self, name: &str) -> AppResult<Device> {
        let device = match self.connector {
            Some(connector) => Device::with_connector(name, connector),
            None => Device::new(name),
        };
        for (child_name, child) in self.children {
            device.attach(&child_name, child)?;
        }
        Ok(device)
    }
}

/// Implement [`Connectable`] for a struct by delegating to a `Device` field.
macro_rules! impl_connectable_via_device {
    ($ty:ty, $field:ident) => {
        #[async_trait::async_trait]
        impl $crate::device::Connectable for $ty {
            fn name(&self) -> String {
                self.$field.name()
            }

            fn set_name(&self, name: &str) {
                self.$field.set_name(name)
            }

            async fn connect(
                &self,
                options: $crate::device::ConnectOptions,
            ) -> $crate::error::AppResult<()> {
                self.$field.connect(options).await
            }

            fn is_connected(&self) -> bool {
                self.$field.is_connected()
            }

            fn into_any(
                self: std::sync::Arc<Self>,
            ) -> std::sync::Arc<dyn std::any::Any + Send + Sync> {
                self
            }
        }
    };
}

pub(crate) use impl_connectable_via_device;
