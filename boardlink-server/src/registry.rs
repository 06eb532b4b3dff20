//! Registry of attached devices.
//!
//! The registry binds a stable device id to a [`Board`] and tracks who may
//! act on it. It is reconciled against detection sweeps, periodically and
//! on demand, and publishes every change as a [`RegistryEvent`].
//!
//! Locking: the device map sits behind a short-lived std mutex that is never
//! held across an await, so slow board I/O never blocks lookups. Reconciles
//! are serialized by a separate async gate. Each device carries its own
//! small lock for holder bookkeeping.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::{
    board::{create_board, simulated, Board, BoardSpec},
    catalog::{BoardTemplate, Catalog, TemplateId},
    connections::ConnectionId,
    protocol::ServerMessage,
    tool::Toolchain,
    tracing::prelude::*,
    transport::{DetectedDevice, Detector, Sweep},
};

const EVENT_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Default)]
struct DeviceState {
    /// Connection holding the flashing lock.
    holder: Option<ConnectionId>,
    /// Connection with the serial monitor open.
    monitor: Option<ConnectionId>,
    removed: bool,
}

/// One tracked board.
pub struct Device {
    id: String,
    template: Arc<BoardTemplate>,
    board: Arc<dyn Board>,
    state: Mutex<DeviceState>,
}

impl Device {
    pub fn new(id: String, template: Arc<BoardTemplate>, board: Arc<dyn Board>) -> Self {
        Self {
            id,
            template,
            board,
            state: Mutex::new(DeviceState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn template(&self) -> &Arc<BoardTemplate> {
        &self.template
    }

    pub fn board(&self) -> &Arc<dyn Board> {
        &self.board
    }

    pub fn to_message(&self) -> ServerMessage {
        self.board.to_message(&self.template.name, &self.id)
    }

    pub fn holder(&self) -> Option<ConnectionId> {
        lock(&self.state).holder
    }

    pub fn monitor(&self) -> Option<ConnectionId> {
        lock(&self.state).monitor
    }

    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }

    /// Set once the device has left the registry.
    pub fn is_removed(&self) -> bool {
        lock(&self.state).removed
    }

    /// Take the flashing lock for `conn`.
    ///
    /// Fails immediately when another connection holds the lock or has the
    /// serial monitor open; nothing is queued. The lock is released when
    /// the returned [`Lease`] drops.
    pub fn try_lock(self: &Arc<Self>, conn: ConnectionId) -> Option<Lease> {
        let mut state = lock(&self.state);
        if state.holder.is_some() || state.monitor.is_some_and(|m| m != conn) {
            return None;
        }
        state.holder = Some(conn);
        drop(state);

        trace!(device = %self.id, conn = %conn, "Device locked");
        Some(Lease {
            device: self.clone(),
            conn,
        })
    }

    /// Claim the serial monitor slot. Fails while the device is being
    /// flashed or monitored by someone else.
    pub fn try_monitor(&self, conn: ConnectionId) -> bool {
        let mut state = lock(&self.state);
        if state.holder.is_some() || state.monitor.is_some_and(|m| m != conn) {
            return false;
        }
        state.monitor = Some(conn);
        true
    }

    pub fn release_monitor(&self, conn: ConnectionId) {
        let mut state = lock(&self.state);
        if state.monitor == Some(conn) {
            state.monitor = None;
        }
    }

    fn mark_removed(&self) -> DeviceState {
        let mut state = lock(&self.state);
        state.removed = true;
        DeviceState {
            holder: state.holder,
            monitor: state.monitor,
            removed: true,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("template", &self.template.name)
            .field("port", &self.board.current_port())
            .finish()
    }
}

/// Exclusive flashing right on one device.
pub struct Lease {
    device: Arc<Device>,
    conn: ConnectionId,
}

impl Lease {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut state = lock(&self.device.state);
        if state.holder == Some(self.conn) {
            state.holder = None;
        }
        trace!(device = %self.device.id, conn = %self.conn, "Device unlocked");
    }
}

/// Change to the device set, as seen by connected clients.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added {
        id: String,
        message: ServerMessage,
    },
    Removed {
        id: String,
        holder: Option<ConnectionId>,
        monitor: Option<ConnectionId>,
    },
    PortChanged {
        id: String,
        ports: Vec<String>,
    },
}

impl RegistryEvent {
    pub fn to_message(&self) -> ServerMessage {
        match self {
            RegistryEvent::Added { message, .. } => message.clone(),
            RegistryEvent::Removed { id, .. } => ServerMessage::DeviceUpdateDelete {
                device_id: id.clone(),
            },
            RegistryEvent::PortChanged { id, ports } => ServerMessage::DeviceUpdatePort {
                device_id: id.clone(),
                ports: ports.clone(),
            },
        }
    }
}

/// Outcome of one reconcile.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub port_changed: Vec<String>,
    /// Sightings of suppressed templates that were deliberately left out.
    pub not_added: Vec<DetectedDevice>,
}

impl ReconcileReport {
    pub fn is_quiet(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.port_changed.is_empty()
    }
}

pub struct DeviceRegistry {
    catalog: Arc<Catalog>,
    detector: Arc<dyn Detector>,
    tools: Arc<Toolchain>,
    devices: Mutex<HashMap<String, Arc<Device>>>,
    reconcile_gate: tokio::sync::Mutex<()>,
    suppressed: Mutex<HashSet<TemplateId>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    pub fn new(catalog: Arc<Catalog>, detector: Arc<dyn Detector>, tools: Arc<Toolchain>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            catalog,
            detector,
            tools,
            devices: Mutex::new(HashMap::new()),
            reconcile_gate: tokio::sync::Mutex::new(()),
            suppressed: Mutex::new(HashSet::new()),
            events,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers just means no clients are connected.
        let _ = self.events.send(event);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Device>> {
        lock(&self.devices).get(id).cloned()
    }

    /// Insert a device. Returns `false` if the id is already taken.
    pub fn add(&self, device: Arc<Device>) -> bool {
        let mut devices = lock(&self.devices);
        if devices.contains_key(device.id()) {
            return false;
        }
        devices.insert(device.id().to_string(), device);
        true
    }

    /// Remove a device and tell everyone it is gone.
    pub fn remove(&self, id: &str) -> Option<Arc<Device>> {
        let device = lock(&self.devices).remove(id)?;
        let state = device.mark_removed();

        info!(device = %id, board = %device.template.name, "Device removed");
        self.publish(RegistryEvent::Removed {
            id: id.to_string(),
            holder: state.holder,
            monitor: state.monitor,
        });
        Some(device)
    }

    /// Snapshot of all devices, ordered by id.
    pub fn list_all(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<_> = lock(&self.devices).values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn len(&self) -> usize {
        lock(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add the configured software-only boards.
    pub fn add_simulated(&self, boards: usize, ms1: usize, delay: Duration) {
        for (id, template, board) in simulated::simulated_devices(boards, ms1, delay) {
            self.add(Arc::new(Device::new(id, template, board)));
        }
        if boards + ms1 > 0 {
            info!(boards, ms1, "Simulated devices added");
        }
    }

    /// Stop auto-registering devices of this template.
    pub fn suppress(&self, template: TemplateId) {
        lock(&self.suppressed).insert(template);
    }

    pub fn allow(&self, template: TemplateId) {
        lock(&self.suppressed).remove(&template);
    }

    pub fn is_suppressed(&self, template: TemplateId) -> bool {
        lock(&self.suppressed).contains(&template)
    }

    /// Re-resolve one device's port before acting on it.
    ///
    /// A device whose board no longer finds its port is removed, and
    /// `false` is returned.
    pub async fn revalidate(&self, device: &Arc<Device>) -> bool {
        if device.board.is_simulated() {
            return !device.is_removed();
        }
        if device.board.refresh(self.detector.as_ref()).await {
            debug!(device = %device.id, port = ?device.board.current_port(), "Port changed");
        }
        if device.board.is_connected() {
            return !device.is_removed();
        }
        warn!(device = %device.id, "Device lost its port");
        self.remove(&device.id);
        false
    }

    /// Build the board for a sighting, without registering it.
    pub fn build_device(&self, detected: &DetectedDevice) -> Option<Arc<Device>> {
        let Some(template) = self.catalog.get(detected.template_id) else {
            warn!(template = detected.template_id, "Sighting of unknown template");
            return None;
        };
        let template = Arc::new(template.clone());
        let spec = BoardSpec {
            template: template.clone(),
            usb: detected.usb.clone(),
            tools: self.tools.clone(),
        };
        let Some(board) = create_board(spec) else {
            warn!(
                board = %template.name,
                class = %template.device_class,
                "No board family registered for device class"
            );
            return None;
        };
        Some(Arc::new(Device::new(detected.id.clone(), template, board)))
    }

    /// Bring the registry in line with what is attached right now.
    ///
    /// One detector sweep per pass. Known hardware devices re-resolve their
    /// ports against it, then newcomers are added and devices that are gone
    /// or have lost their port are dropped. Simulated devices are left alone.
    pub async fn reconcile(&self) -> ReconcileReport {
        let _gate = self.reconcile_gate.lock().await;
        let mut report = ReconcileReport::default();

        let known: Vec<_> = self
            .list_all()
            .into_iter()
            .filter(|d| !d.board.is_simulated())
            .collect();

        let sweep = Sweep::new(self.detector.detect().await);

        for device in &known {
            let changed = device.board.refresh(&sweep).await;
            if changed && device.board.is_connected() {
                debug!(device = %device.id, port = ?device.board.current_port(), "Port changed");
                report.port_changed.push(device.id.clone());
                self.publish(RegistryEvent::PortChanged {
                    id: device.id.clone(),
                    ports: device.board.ports(),
                });
            }
        }

        let detected = sweep.devices();
        let seen: HashSet<&str> = detected.iter().map(|d| d.id.as_str()).collect();

        for device in &known {
            let gone = !seen.contains(device.id.as_str()) || !device.board.is_connected();
            if gone && self.remove(&device.id).is_some() {
                report.removed.push(device.id.clone());
            }
        }

        for sighting in detected {
            if self.get(&sighting.id).is_some() {
                continue;
            }
            if self.is_suppressed(sighting.template_id) {
                trace!(device = %sighting.id, template = sighting.template_id, "Suppressed sighting");
                report.not_added.push(sighting.clone());
                continue;
            }
            let Some(device) = self.build_device(sighting) else {
                continue;
            };
            if self.add(device.clone()) {
                info!(
                    device = %device.id,
                    board = %device.template.name,
                    kind = device.board.message_kind(),
                    port = ?device.board.current_port(),
                    "Device added"
                );
                report.added.push(device.id.clone());
                self.publish(RegistryEvent::Added {
                    id: device.id.clone(),
                    message: device.to_message(),
                });
            }
        }

        report
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted detector for tests.

    use super::*;
    use crate::transport::UsbDeviceInfo;
    use async_trait::async_trait;

    /// Reports whatever the test put in `attached`; a refresh finds a device
    /// when a sighting with the same device path is attached.
    #[derive(Default)]
    pub struct ScriptedDetector {
        pub attached: Mutex<Vec<DetectedDevice>>,
        pub sweeps: std::sync::atomic::AtomicUsize,
        pub refreshes: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedDetector {
        pub fn attach(&self, device: DetectedDevice) {
            lock(&self.attached).push(device);
        }

        pub fn detach(&self, id: &str) {
            lock(&self.attached).retain(|d| d.id != id);
        }

        pub fn sweeps(&self) -> usize {
            self.sweeps.load(std::sync::atomic::Ordering::SeqCst)
        }

        pub fn refreshes(&self) -> usize {
            self.refreshes.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Detector for ScriptedDetector {
        async fn detect(&self) -> Vec<DetectedDevice> {
            self.sweeps.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            lock(&self.attached).clone()
        }

        async fn refresh_port(&self, usb: &UsbDeviceInfo) -> Option<Vec<String>> {
            self.refreshes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            lock(&self.attached)
                .iter()
                .find(|d| d.usb.device_path == usb.device_path)
                .map(|d| d.usb.serial_ports.clone())
        }
    }

    pub fn sighting(id: &str, template_id: TemplateId, vid: u16, pid: u16, port: &str) -> DetectedDevice {
        DetectedDevice {
            id: id.to_string(),
            template_id,
            usb: UsbDeviceInfo {
                vid,
                pid,
                serial_number: Some(id.to_string()),
                device_path: format!("/sys/bus/usb/devices/{}", id),
                serial_ports: vec![port.to_string()],
                ..Default::default()
            },
        }
    }

    /// Catalog id of the Uno entry in the built-in catalog.
    pub fn uno_sighting(id: &str, port: &str) -> DetectedDevice {
        let catalog = Catalog::builtin().unwrap();
        let uno = catalog.find(0x2341, 0x0043).unwrap();
        sighting(id, uno.id, 0x2341, 0x0043, port)
    }
}
