// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Device ports: the selectable routing targets of a sink.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortAvailable {
    #[default]
    Unknown,
    No,
    Yes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePort {
    pub name: String,
    pub description: String,
    pub priority: u32,
    /// Extra latency of this port in microseconds, may be negative.
    pub latency_offset: i64,
    pub available: PortAvailable,
}

impl DevicePort {
    pub fn new(name: impl Into<String>, description: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            priority,
            latency_offset: 0,
            available: PortAvailable::Unknown,
        }
    }

    pub fn with_latency_offset(mut self, offset: i64) -> Self {
        self.latency_offset = offset;
        self
    }
}

/// The port with the highest priority. Ties go to the first by name.
pub fn highest_priority(ports: &BTreeMap<String, DevicePort>) -> Option<&DevicePort> {
    ports.values().fold(None, |best: Option<&DevicePort>, p| match best {
        Some(b) if b.priority >= p.priority => Some(b),
        _ => Some(p),
    })
}
