// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Daemon service: owns the engine core and runs its periodic housekeeping.

use crate::config::{ConfigError, DaemonConfig, IdleSuspendConfig};
use crate::null_sink::create_null_sink;
use sinkmix::{ClearSwitchCause, Core, SinkError, SuspendCause};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

pub struct DaemonService {
    core: Core,
    idle: IdleSuspendConfig,
    /// When each unused sink was first seen unused.
    idle_since: HashMap<u32, Instant>,
}

impl DaemonService {
    pub fn new(config: &DaemonConfig) -> Self {
        let mut core = Core::new(config.core.clone());
        core.set_suspend_policy(Some(Box::new(ClearSwitchCause)));
        Self {
            core,
            idle: config.idle_suspend.clone(),
            idle_since: HashMap::new(),
        }
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    #[allow(dead_code)]
    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    /// Creates every configured sink. A sink that fails is skipped.
    pub fn create_sinks(&mut self, config: &DaemonConfig) -> usize {
        let mut created = 0;
        for sink in &config.sinks {
            match create_null_sink(&mut self.core, sink) {
                Ok(_) => created += 1,
                Err(e) => warn!("Failed to create sink \"{}\": {}", sink.name, e),
            }
        }
        created
    }

    /// One housekeeping pass: IO-thread notices, idle suspension and
    /// change events.
    pub fn tick(&mut self, now: Instant) {
        self.core.dispatch_notices();

        if self.idle.enabled {
            if let Err(e) = self.update_idle(now) {
                warn!("Idle suspend pass failed: {}", e);
            }
        }

        for event in self.core.take_events() {
            debug!(
                "Event: {:?} {:?} #{}",
                event.facility, event.kind, event.index
            );
        }
    }

    fn update_idle(&mut self, now: Instant) -> Result<(), DaemonError> {
        let timeout = Duration::from_secs(self.idle.timeout_secs);
        let sinks: Vec<(u32, SuspendCause)> = self
            .core
            .sinks()
            .filter(|s| s.state().is_linked())
            .map(|s| (s.index(), s.suspend_cause()))
            .collect();
        self.idle_since
            .retain(|index, _| sinks.iter().any(|(i, _)| i == index));

        for (index, cause) in sinks {
            let idle_suspended = cause.contains(SuspendCause::IDLE);
            if self.core.sink_check_suspend(index)? > 0 {
                self.idle_since.remove(&index);
                if idle_suspended {
                    info!("Sink {} in use again, resuming", index);
                    self.core.sink_suspend(index, false, SuspendCause::IDLE)?;
                }
                continue;
            }

            let since = *self.idle_since.entry(index).or_insert(now);
            if !idle_suspended && now.duration_since(since) >= timeout {
                info!("Sink {} idle for {:?}, suspending", index, timeout);
                self.core.sink_suspend(index, true, SuspendCause::IDLE)?;
            }
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        info!("Unlinking all sinks");
        self.core.unlink_all();
        self.idle_since.clear();
    }
}
