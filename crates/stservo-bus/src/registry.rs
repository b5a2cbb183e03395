use std::collections::BTreeMap;

use tracing::info;

use crate::{BusHandle, BusSettings};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error(
        "serial port {port} is already open at {existing} baud, cannot also use {requested} baud"
    )]
    BaudMismatch { port: String, existing: u32, requested: u32 },
}

/// Maps port strings to the one bus that owns each port.
#[derive(Debug, Default)]
pub struct BusRegistry {
    settings: BusSettings,
    buses: BTreeMap<String, BusHandle>,
}

impl BusRegistry {
    pub fn new(settings: BusSettings) -> Self {
        Self { settings, buses: BTreeMap::new() }
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    /// Returns the bus for `port`, opening the serial port on first request.
    pub fn get_or_open(&mut self, port: &str, baud: u32) -> Result<BusHandle, RegistryError> {
        self.get_or_spawn_with(port, baud, |settings| {
            BusHandle::open_serial(port, baud, settings.clone())
        })
    }

    /// Like [`get_or_open`](Self::get_or_open) with a caller-supplied bus
    /// constructor, used for simulated buses.
    pub fn get_or_spawn_with<F>(
        &mut self,
        port: &str,
        baud: u32,
        spawn: F,
    ) -> Result<BusHandle, RegistryError>
    where
        F: FnOnce(&BusSettings) -> BusHandle,
    {
        if let Some(bus) = self.buses.get(port) {
            if bus.baud() != baud {
                return Err(RegistryError::BaudMismatch {
                    port: port.to_string(),
                    existing: bus.baud(),
                    requested: baud,
                });
            }
            return Ok(bus.clone());
        }
        let bus = spawn(&self.settings);
        info!("bus registry: {} @ {} baud", port, baud);
        self.buses.insert(port.to_string(), bus.clone());
        Ok(bus)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BusHandle)> {
        self.buses.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBus;

    #[tokio::test]
    async fn same_port_resolves_to_one_bus() {
        let sim = SimulatedBus::new();
        let mut reg = BusRegistry::default();
        let mut spawned = 0;

        for _ in 0..2 {
            reg.get_or_spawn_with("/dev/ttyUSB0", 1_000_000, |s| {
                spawned += 1;
                sim.spawn_bus("/dev/ttyUSB0", 1_000_000, s.clone())
            })
            .unwrap();
        }
        assert_eq!(spawned, 1);
        assert_eq!(reg.iter().count(), 1);

        let err = reg
            .get_or_spawn_with("/dev/ttyUSB0", 115_200, |s| {
                sim.spawn_bus("/dev/ttyUSB0", 115_200, s.clone())
            })
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::BaudMismatch {
                port: "/dev/ttyUSB0".into(),
                existing: 1_000_000,
                requested: 115_200,
            }
        );
    }
}
