use tokio::sync::mpsc;
use tracing::warn;

use crate::core::DeviceEvent;

pub mod simulated;

pub use simulated::{SimulatedDeviceBus, SimulatedTransport, TransportProbe};

/// Source of device plug/unplug events.
pub trait DeviceBus: Send + Sync {
    /// Start listening for device events. Spawns internal tasks that send
    /// events to the provided channel.
    fn start(&self, event_sender: mpsc::Sender<DeviceEvent>);
}

pub fn get_bus(simulation: bool) -> Box<dyn DeviceBus> {
    if simulation {
        let (bus, controller) = simulated::SimulatedDeviceBus::new();

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines() {
                if let Ok(cmd) = line {
                    let parts: Vec<&str> = cmd.trim().split_whitespace().collect();
                    match parts.first().copied() {
                        Some("plug") => controller.plug(parts.get(1).unwrap_or(&"sim-device")),
                        Some("unplug") => controller.unplug(parts.get(1).unwrap_or(&"sim-device")),
                        _ => println!("(Simulator) Use: 'plug <id>' or 'unplug <id>'"),
                    }
                }
            }
        });

        return Box::new(bus);
    }

    Box::new(NullBus)
}

/// Placeholder bus for builds without a native discovery backend; emits no
/// events.
struct NullBus;

impl DeviceBus for NullBus {
    fn start(&self, _event_sender: mpsc::Sender<DeviceEvent>) {
        warn!("no native device discovery backend; no devices will appear (use --simulation)");
    }
}
