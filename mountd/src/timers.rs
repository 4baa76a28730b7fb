// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! One-shot monotonic timers, one per unit. Each armed unit owns a timerfd
//! registered with the event loop under its own token.

use std::collections::HashMap;
use std::time;

use tracing::trace;

use crate::units::UnitKey;

struct UnitTimer {
    fd: mio_timerfd::TimerFd,
    token: mio::Token,
    armed: bool,
}

#[derive(Default)]
pub struct Timers {
    by_unit: HashMap<UnitKey, UnitTimer>,
}

impl Timers {
    /// Arms (or re-arms) the timer for a unit, replacing any previous
    /// deadline. The token is only consumed when the unit doesn't have a
    /// timerfd yet; `alloc` hands one out on demand.
    pub fn arm(
        &mut self,
        registry: &mio::Registry,
        alloc: impl FnOnce() -> mio::Token,
        key: UnitKey,
        timeout: time::Duration,
    ) -> anyhow::Result<Option<mio::Token>> {
        trace!(?key, ?timeout, "arming unit timer");

        if let Some(timer) = self.by_unit.get_mut(&key) {
            timer.fd.set_timeout(&timeout)?;
            timer.armed = true;
            return Ok(None);
        }

        let mut fd = mio_timerfd::TimerFd::new(mio_timerfd::ClockId::Monotonic)?;
        let token = alloc();
        registry.register(&mut fd, token, mio::Interest::READABLE)?;
        fd.set_timeout(&timeout)?;

        self.by_unit.insert(key, UnitTimer { fd, token, armed: true });
        Ok(Some(token))
    }

    /// Disarms without firing. Idempotent; unknown units are fine.
    pub fn cancel(&mut self, key: UnitKey) {
        if let Some(timer) = self.by_unit.get_mut(&key) {
            if timer.armed {
                trace!(?key, "canceling unit timer");
                let _ = timer.fd.disarm();
                timer.armed = false;
            }
        }
    }

    pub fn armed(&self, key: UnitKey) -> bool {
        self.by_unit.get(&key).is_some_and(|t| t.armed)
    }

    /// Acknowledges an expiry event for the unit. Returns false for timers
    /// that were already disarmed (a stale wakeup).
    pub fn acknowledge(&mut self, key: UnitKey) -> bool {
        match self.by_unit.get_mut(&key) {
            Some(timer) => {
                let _ = timer.fd.read();
                std::mem::replace(&mut timer.armed, false)
            }
            None => false,
        }
    }

    /// Drops the unit's timerfd entirely, e.g. when the unit is released.
    /// Returns the token to recycle.
    pub fn remove(&mut self, registry: &mio::Registry, key: UnitKey) -> Option<mio::Token> {
        let mut timer = self.by_unit.remove(&key)?;
        let _ = registry.deregister(&mut timer.fd);
        Some(timer.token)
    }
}
