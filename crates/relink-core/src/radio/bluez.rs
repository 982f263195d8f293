//! BlueZ radio over D-Bus.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, Session};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{cancel_on_drop, Radio, RadioError, RadioResult};
use crate::types::{CharacteristicRef, ConnectionEvent, DeviceId, DiscoveryEvent};

fn op_error(e: &bluer::Error) -> RadioError {
    RadioError::Operation(e.to_string())
}

/// [`Radio`] backed by the system BlueZ daemon.
pub struct BluezRadio {
    session: Session,
    adapter_name: Option<String>,
    scan: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for BluezRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluezRadio")
            .field("adapter_name", &self.adapter_name)
            .finish_non_exhaustive()
    }
}

impl BluezRadio {
    /// Connect to BlueZ. `adapter_name` selects an adapter such as `hci0`;
    /// `None` uses the default one.
    ///
    /// # Errors
    ///
    /// Returns an error if the D-Bus session cannot be opened.
    pub async fn new(adapter_name: Option<String>) -> RadioResult<Self> {
        let session = Session::new().await.map_err(|e| op_error(&e))?;
        info!(adapter = ?adapter_name, "Connected to BlueZ");
        Ok(Self {
            session,
            adapter_name,
            scan: Mutex::new(None),
        })
    }

    async fn adapter(&self) -> RadioResult<Adapter> {
        let adapter = match &self.adapter_name {
            Some(name) => self.session.adapter(name),
            None => self.session.default_adapter().await,
        }
        .map_err(|e| {
            debug!(error = %e, "Adapter lookup failed");
            RadioError::AdapterNotFound
        })?;

        if !adapter.is_powered().await.map_err(|e| op_error(&e))? {
            return Err(RadioError::AdapterPoweredOff);
        }
        Ok(adapter)
    }

    fn address(device_id: &DeviceId) -> RadioResult<Address> {
        device_id
            .as_str()
            .parse()
            .map_err(|_| RadioError::DeviceNotFound {
                device_id: device_id.clone(),
            })
    }

    async fn device(&self, device_id: &DeviceId) -> RadioResult<bluer::Device> {
        let adapter = self.adapter().await?;
        adapter
            .device(Self::address(device_id)?)
            .map_err(|_| RadioError::DeviceNotFound {
                device_id: device_id.clone(),
            })
    }

    async fn connected_device(&self, device_id: &DeviceId) -> RadioResult<bluer::Device> {
        let device = self.device(device_id).await?;
        if !device.is_connected().await.map_err(|e| op_error(&e))? {
            return Err(RadioError::NotConnected {
                device_id: device_id.clone(),
            });
        }
        Ok(device)
    }

    async fn characteristic(
        &self,
        device_id: &DeviceId,
        target: &CharacteristicRef,
    ) -> RadioResult<Characteristic> {
        let device = self.connected_device(device_id).await?;
        for service in device.services().await.map_err(|e| op_error(&e))? {
            if service.uuid().await.map_err(|e| op_error(&e))? != target.service {
                continue;
            }
            for characteristic in service.characteristics().await.map_err(|e| op_error(&e))? {
                if characteristic.uuid().await.map_err(|e| op_error(&e))? == target.characteristic {
                    return Ok(characteristic);
                }
            }
        }
        Err(RadioError::CharacteristicNotFound {
            characteristic: *target,
        })
    }

    fn replace_scan(&self, token: Option<CancellationToken>) {
        let mut scan = self
            .scan
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = std::mem::replace(&mut *scan, token) {
            previous.cancel();
        }
    }
}

async fn describe(adapter: &Adapter, address: Address) -> Option<DiscoveryEvent> {
    let device_id = DeviceId::parse(address.to_string()).ok()?;
    let device = adapter.device(address).ok()?;
    let mut event = DiscoveryEvent::new(device_id);
    event.name = device.name().await.ok().flatten();
    event.rssi = device.rssi().await.ok().flatten();
    Some(event)
}

fn watch_device(
    adapter: &Adapter,
    address: Address,
    tx: UnboundedSender<ConnectionEvent>,
    token: CancellationToken,
) -> RadioResult<()> {
    let device = adapter.device(address).map_err(|e| op_error(&e))?;
    let Ok(device_id) = DeviceId::parse(address.to_string()) else {
        return Ok(());
    };

    tokio::spawn(async move {
        let events = tokio::select! {
            () = token.cancelled() => return,
            events = device.events() => match events {
                Ok(events) => events,
                Err(e) => {
                    debug!(%address, error = %e, "Device events unavailable");
                    return;
                }
            },
        };
        let mut events = std::pin::pin!(events);
        loop {
            let event = tokio::select! {
                () = token.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event else {
                continue;
            };
            let event = if connected {
                ConnectionEvent::connected(device_id.clone())
            } else {
                ConnectionEvent::disconnected(device_id.clone(), None)
            };
            if tx.unbounded_send(event).is_err() {
                break;
            }
        }
    });
    Ok(())
}

#[async_trait]
impl Radio for BluezRadio {
    async fn start_scan(&self) -> RadioResult<BoxStream<'static, DiscoveryEvent>> {
        let adapter = self.adapter().await?;
        let discovery = adapter
            .discover_devices_with_changes()
            .await
            .map_err(|e| RadioError::ScanRejected(e.to_string()))?;

        let token = CancellationToken::new();
        self.replace_scan(Some(token.clone()));

        let (tx, rx) = unbounded();
        let stream = cancel_on_drop(rx, &token);
        tokio::spawn(async move {
            let mut discovery = std::pin::pin!(discovery);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = discovery.next() => match event {
                        Some(AdapterEvent::DeviceAdded(address)) => {
                            let Some(event) = describe(&adapter, address).await else {
                                continue;
                            };
                            if tx.unbounded_send(event).is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            debug!("BlueZ discovery session ended");
        });
        Ok(stream)
    }

    async fn stop_scan(&self) -> RadioResult<()> {
        self.replace_scan(None);
        Ok(())
    }

    async fn connect(&self, device_id: &DeviceId) -> RadioResult<()> {
        let device = self.device(device_id).await?;
        device
            .connect()
            .await
            .map_err(|e| RadioError::ConnectRejected {
                device_id: device_id.clone(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self, device_id: &DeviceId) -> RadioResult<()> {
        let device = self.device(device_id).await?;
        if device.is_connected().await.map_err(|e| op_error(&e))? {
            device.disconnect().await.map_err(|e| op_error(&e))?;
        }
        Ok(())
    }

    async fn connection_events(&self) -> RadioResult<BoxStream<'static, ConnectionEvent>> {
        let adapter = self.adapter().await?;
        let adapter_events = adapter.events().await.map_err(|e| op_error(&e))?;
        let known = adapter.device_addresses().await.map_err(|e| op_error(&e))?;

        // Cancelled when the caller drops the stream; every watcher below ends with it.
        let token = CancellationToken::new();
        let (tx, rx) = unbounded();
        let stream = cancel_on_drop(rx, &token);

        let mut watched = HashSet::new();
        for address in known {
            watch_device(&adapter, address, tx.clone(), token.child_token())?;
            watched.insert(address);
        }

        tokio::spawn(async move {
            let mut adapter_events = std::pin::pin!(adapter_events);
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    event = adapter_events.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let AdapterEvent::DeviceAdded(address) = event {
                    if watched.insert(address) {
                        if let Err(e) =
                            watch_device(&adapter, address, tx.clone(), token.child_token())
                        {
                            warn!(%address, error = %e, "Failed to watch device");
                        }
                    }
                }
            }
            // Ends the stream when the adapter goes away, so the caller resubscribes.
            token.cancel();
            debug!("BlueZ connection watch ended");
        });
        Ok(stream)
    }

    async fn pair(&self, device_id: &DeviceId) -> RadioResult<()> {
        let device = self.device(device_id).await?;
        if device.is_paired().await.map_err(|e| op_error(&e))? {
            return Ok(());
        }
        device.pair().await.map_err(|e| op_error(&e))
    }

    async fn unpair(&self, device_id: &DeviceId) -> RadioResult<()> {
        let adapter = self.adapter().await?;
        adapter
            .remove_device(Self::address(device_id)?)
            .await
            .map_err(|e| op_error(&e))
    }

    async fn discover_services(&self, device_id: &DeviceId) -> RadioResult<Vec<Uuid>> {
        let device = self.connected_device(device_id).await?;
        let mut uuids = Vec::new();
        for service in device.services().await.map_err(|e| op_error(&e))? {
            uuids.push(service.uuid().await.map_err(|e| op_error(&e))?);
        }
        Ok(uuids)
    }

    async fn read(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
    ) -> RadioResult<Vec<u8>> {
        let characteristic = self.characteristic(device_id, characteristic).await?;
        characteristic.read().await.map_err(|e| op_error(&e))
    }

    async fn write(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> RadioResult<()> {
        let characteristic = self.characteristic(device_id, characteristic).await?;
        characteristic.write(value).await.map_err(|e| op_error(&e))
    }

    async fn subscribe(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
    ) -> RadioResult<BoxStream<'static, Vec<u8>>> {
        let characteristic = self.characteristic(device_id, characteristic).await?;
        let values = characteristic.notify().await.map_err(|e| op_error(&e))?;
        Ok(values.boxed())
    }
}
