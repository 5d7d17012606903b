//! Per-device runtime state.

use para_core::{Device, FlightState, Site};
use para_sdk::Publish;
use std::sync::Arc;

/// How a session reaches the broker.
pub enum TransportHandle<T> {
    /// A connection owned by this device alone.
    Dedicated(T),
    /// A pool connection shared with other devices.
    Pooled(Arc<T>),
}

impl<T: Publish> TransportHandle<T> {
    pub fn get(&self) -> &T {
        match self {
            TransportHandle::Dedicated(transport) => transport,
            TransportHandle::Pooled(transport) => transport.as_ref(),
        }
    }

    pub fn is_dedicated(&self) -> bool {
        matches!(self, TransportHandle::Dedicated(_))
    }

    /// Close a dedicated connection. Pooled connections belong to the pool
    /// and are left open.
    pub async fn release(&self) {
        if let TransportHandle::Dedicated(transport) = self {
            transport.close().await;
        }
    }
}

/// One registered device and everything its worker owns.
pub struct DeviceSession<T> {
    pub device: Device,
    pub site: Site,
    pub state: FlightState,
    pub transport: TransportHandle<T>,
    pub active: bool,
}

impl<T: Publish> DeviceSession<T> {
    pub fn new(device: Device, site: Site, state: FlightState, transport: TransportHandle<T>) -> Self {
        Self {
            device,
            site,
            state,
            transport,
            active: true,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }
}
