use std::collections::BTreeMap;
use std::net::IpAddr;

/// Result of probing one machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Whether the remote-desktop port accepted a connection.
    pub reachable: bool,
    /// Address the machine name resolved to, if resolution succeeded.
    pub address: Option<IpAddr>,
}

impl ProbeOutcome {
    /// An unreachable outcome with no resolved address.
    pub fn unreachable() -> Self {
        Self::default()
    }
}

/// A probe outcome tagged with the refresh tick that issued it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    /// Machine that was probed.
    pub machine: String,
    /// Refresh tick that requested the probe.
    pub tick: u64,
    /// What the probe observed.
    pub outcome: ProbeOutcome,
}

/// A resolved address that differs from the last accepted one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressChange {
    /// Address recorded for the machine.
    pub previous: IpAddr,
    /// Address the name resolves to now.
    pub current: IpAddr,
}

/// Latest known status of one machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineStatus {
    /// Whether the last applied probe succeeded.
    pub reachable: bool,
    /// Address resolved by the last applied probe.
    pub address: Option<IpAddr>,
    /// Set while the resolved address disagrees with the recorded one.
    pub address_change: Option<AddressChange>,
    /// Tick of the probe this status came from.
    pub tick: u64,
}

/// Transient reachability map. Never persisted.
#[derive(Clone, Debug, Default)]
pub struct StatusSnapshot {
    entries: BTreeMap<String, MachineStatus>,
}

impl StatusSnapshot {
    /// Status of a machine, if it has been probed.
    pub fn get(&self, machine: &str) -> Option<&MachineStatus> {
        self.entries.get(machine)
    }

    /// Whether the machine answered its last probe. Unprobed machines are down.
    pub fn is_reachable(&self, machine: &str) -> bool {
        self.entries.get(machine).is_some_and(|status| status.reachable)
    }

    /// Pending address change for a machine.
    pub fn address_change(&self, machine: &str) -> Option<AddressChange> {
        self.entries.get(machine).and_then(|status| status.address_change)
    }

    /// Machines that currently have a status entry.
    pub fn machines(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of machines reported reachable.
    pub fn reachable_count(&self) -> usize {
        self.entries.values().filter(|status| status.reachable).count()
    }

    pub(crate) fn insert(&mut self, machine: String, status: MachineStatus) {
        self.entries.insert(machine, status);
    }

    pub(crate) fn clear_address_change(&mut self, machine: &str) {
        if let Some(status) = self.entries.get_mut(machine) {
            status.address_change = None;
        }
    }

    pub(crate) fn remove(&mut self, machine: &str) {
        self.entries.remove(machine);
    }
}
