//! Per-instance circuit breakers fed by CanHandle queries and dispatch attempts.
//!
//! Breakers live outside the registry so the routing path can update them
//! without touching registry state. A trip is reported back to the caller,
//! which forwards it to the registry writer as an isolation request.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use switchyard_common::InstanceId;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitBreakerState,
    consecutive_failures: u32,
    /// Trips since the last success, drives the cooldown backoff.
    trips: u32,
    open_until: Option<Instant>,
}

impl Breaker {
    fn closed() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            consecutive_failures: 0,
            trips: 0,
            open_until: None,
        }
    }
}

/// A breaker trip: the instance should be isolated until `until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trip {
    pub cooldown: Duration,
    pub until: Instant,
}

#[derive(Debug)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: DashMap<InstanceId, Breaker>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Whether the instance may be tried now.
    ///
    /// An open breaker whose cooldown has passed moves to half-open and lets
    /// the next attempt through as a probe.
    pub fn allows(&self, instance_id: &InstanceId, now: Instant) -> bool {
        let Some(mut breaker) = self.breakers.get_mut(instance_id) else {
            return true;
        };
        match breaker.state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => {
                if breaker.open_until.map(|until| now >= until).unwrap_or(true) {
                    breaker.state = CircuitBreakerState::HalfOpen;
                    breaker.open_until = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, instance_id: &InstanceId) {
        if let Some(mut breaker) = self.breakers.get_mut(instance_id) {
            *breaker = Breaker::closed();
        }
    }

    /// Counts a failure; returns the trip when this failure opened the breaker.
    pub fn record_failure(&self, instance_id: &InstanceId, now: Instant) -> Option<Trip> {
        let mut breaker = self
            .breakers
            .entry(instance_id.clone())
            .or_insert_with(Breaker::closed);
        breaker.consecutive_failures += 1;

        let should_open = match breaker.state {
            CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Closed => breaker.consecutive_failures >= self.config.failure_threshold,
            CircuitBreakerState::Open => false,
        };
        if !should_open {
            return None;
        }

        breaker.trips += 1;
        let cooldown = self.config.cooldown(breaker.trips);
        let until = now + cooldown;
        breaker.state = CircuitBreakerState::Open;
        breaker.open_until = Some(until);
        Some(Trip { cooldown, until })
    }

    pub fn state(&self, instance_id: &InstanceId) -> CircuitBreakerState {
        self.breakers
            .get(instance_id)
            .map(|b| b.state)
            .unwrap_or(CircuitBreakerState::Closed)
    }

    pub fn consecutive_failures(&self, instance_id: &InstanceId) -> u32 {
        self.breakers
            .get(instance_id)
            .map(|b| b.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn remove(&self, instance_id: &InstanceId) {
        self.breakers.remove(instance_id);
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|b| b.state == CircuitBreakerState::Open)
            .count()
    }
}
