//! Hot-plug monitoring by snapshot diffing.
//!
//! A background thread re-enumerates every poll interval and pushes the
//! difference between successive snapshots into an `mpsc` channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::DeviceFilter;
use crate::device::DeviceDescriptor;
use crate::error::UsbError;

/// Longest sleep between stop checks.
const STOP_CHECK: Duration = Duration::from_millis(50);

/// Attach/detach notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(DeviceDescriptor),
    Disconnected(DeviceDescriptor),
}

impl DeviceEvent {
    pub fn device(&self) -> &DeviceDescriptor {
        match self {
            DeviceEvent::Connected(d) | DeviceEvent::Disconnected(d) => d,
        }
    }
}

/// Receiving end of a hot-plug watch. Dropping it stops the watcher thread.
///
/// Events come from comparing successive snapshots, so an unplug and replug
/// that both happen within one poll interval, at the same bus location and
/// with the same identity, produce no event.
pub struct DeviceMonitor {
    receiver: mpsc::Receiver<DeviceEvent>,
    stop: Arc<AtomicBool>,
    handler: Option<thread::JoinHandle<()>>,
}

impl DeviceMonitor {
    /// Start watching. `snapshot` is called once here, so an enumeration
    /// failure is returned to the caller instead of being lost in the thread.
    ///
    /// Devices already attached are reported as `Connected` first.
    pub(crate) fn spawn<F>(
        mut snapshot: F,
        filter: DeviceFilter,
        poll_interval: Duration,
    ) -> Result<Self, UsbError>
    where
        F: FnMut() -> Result<Vec<DeviceDescriptor>, UsbError> + Send + 'static,
    {
        let mut known = matching(snapshot()?, &filter);
        let (sender, receiver) = mpsc::channel();
        for device in &known {
            // Receiver is alive; cannot fail.
            let _ = sender.send(DeviceEvent::Connected(device.clone()));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handler = thread::spawn(move || {
            debug!(interval_ms = poll_interval.as_millis() as u64, "Device monitor started");
            loop {
                if !sleep_unless_stopped(&stop_flag, poll_interval) {
                    break;
                }

                let current = match snapshot() {
                    Ok(devices) => matching(devices, &filter),
                    Err(e) => {
                        warn!(error = %e, "Device enumeration failed, retrying");
                        continue;
                    }
                };

                let mut events = Vec::new();
                for gone in known
                    .iter()
                    .filter(|d| !contains(&current, d))
                {
                    events.push(DeviceEvent::Disconnected(gone.clone()));
                }
                for new in current.iter().filter(|d| !contains(&known, d)) {
                    events.push(DeviceEvent::Connected(new.clone()));
                }
                known = current;

                for event in events {
                    debug!(?event, "Device event");
                    if sender.send(event).is_err() {
                        return;
                    }
                }
            }
            debug!("Device monitor stopped");
        });

        Ok(Self {
            receiver,
            stop,
            handler: Some(handler),
        })
    }

    /// Next event, blocking. `None` once the watcher has stopped.
    pub fn recv(&self) -> Option<DeviceEvent> {
        self.receiver.recv().ok()
    }

    /// Next event, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<DeviceEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Events already queued, without blocking.
    pub fn try_iter(&self) -> impl Iterator<Item = DeviceEvent> + '_ {
        self.receiver.try_iter()
    }

    /// Stop watching. Equivalent to dropping the monitor.
    pub fn stop(self) {}
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handler) = self.handler.take() {
            let _ = handler.join();
        }
    }
}

fn matching(devices: Vec<DeviceDescriptor>, filter: &DeviceFilter) -> Vec<DeviceDescriptor> {
    devices.into_iter().filter(|d| filter.matches(d)).collect()
}

/// Devices are the same if identity and bus location agree.
fn contains(devices: &[DeviceDescriptor], device: &DeviceDescriptor) -> bool {
    devices
        .iter()
        .any(|d| d.identity() == device.identity() && d.location() == device.location())
}

/// Returns false if a stop was requested during the sleep.
fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(STOP_CHECK));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn device(pid: u16, address: u8) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: 0x05AC,
            product_id: pid,
            bus_id: "1".into(),
            address,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_snapshot_error_is_returned() {
        let result = DeviceMonitor::spawn(
            || Err(UsbError::Enumeration("no registry".into())),
            DeviceFilter::any(),
            Duration::from_millis(10),
        );
        assert!(matches!(result, Err(UsbError::Enumeration(_))));
    }

    #[test]
    fn test_connect_and_disconnect_events() {
        let attached = Arc::new(Mutex::new(vec![device(0x1281, 3)]));
        let source = Arc::clone(&attached);
        let monitor = DeviceMonitor::spawn(
            move || Ok(source.lock().unwrap().clone()),
            DeviceFilter::apple_modes(),
            Duration::from_millis(10),
        )
        .unwrap();

        assert_eq!(
            monitor.recv_timeout(Duration::from_secs(1)),
            Some(DeviceEvent::Connected(device(0x1281, 3)))
        );

        // Device drops into DFU mode: new product id on a new address
        *attached.lock().unwrap() = vec![device(0x1227, 4)];

        let mut events = Vec::new();
        while events.len() < 2 {
            match monitor.recv_timeout(Duration::from_secs(2)) {
                Some(e) => events.push(e),
                None => break,
            }
        }
        assert!(events.contains(&DeviceEvent::Disconnected(device(0x1281, 3))));
        assert!(events.contains(&DeviceEvent::Connected(device(0x1227, 4))));
    }

    #[test]
    fn test_filter_hides_other_devices() {
        let other = device(0x12A8, 5);
        let monitor = DeviceMonitor::spawn(
            move || Ok(vec![other.clone()]),
            DeviceFilter::apple_modes(),
            Duration::from_millis(10),
        )
        .unwrap();
        assert!(monitor.recv_timeout(Duration::from_millis(100)).is_none());
    }

    #[test]
    fn test_drop_stops_thread() {
        let monitor = DeviceMonitor::spawn(
            || Ok(Vec::new()),
            DeviceFilter::any(),
            Duration::from_secs(60),
        )
        .unwrap();
        let start = Instant::now();
        drop(monitor);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
