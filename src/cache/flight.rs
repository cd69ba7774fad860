//! Per-key flight lock.
//!
//! The first caller to miss on a key becomes the leader and computes; later
//! callers for the same key wait for the leader's payload instead of running
//! the same query again.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;

use super::lock::{mutex_lock, recover};

const SOURCE: &str = "cache::flight";

#[derive(Debug)]
enum FlightState {
    Running,
    Finished(Option<Bytes>),
}

#[derive(Debug)]
struct Flight {
    state: Mutex<FlightState>,
    done: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Running),
            done: Condvar::new(),
        }
    }

    fn finish(&self, payload: Option<Bytes>) {
        let mut state = mutex_lock(&self.state, SOURCE, "finish");
        if matches!(*state, FlightState::Running) {
            *state = FlightState::Finished(payload);
        }
        self.done.notify_all();
    }
}

/// How a follower's wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlightOutcome {
    /// The leader published a serialized result.
    Ready(Bytes),
    /// The leader finished without a result (error or panic).
    Abandoned,
    TimedOut,
}

#[derive(Default)]
pub struct InFlight {
    flights: DashMap<String, Arc<Flight>>,
}

pub enum FlightRole {
    Leader(FlightGuard),
    Follower(FlightWaiter),
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(self: &Arc<Self>, key: &str) -> FlightRole {
        use dashmap::mapref::entry::Entry;

        match self.flights.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                let flight = Arc::new(Flight::new());
                vacant.insert(Arc::clone(&flight));
                FlightRole::Leader(FlightGuard {
                    key: key.to_string(),
                    flight,
                    owner: Arc::clone(self),
                })
            }
            Entry::Occupied(occupied) => FlightRole::Follower(FlightWaiter {
                flight: Arc::clone(occupied.get()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

/// Held by the leader. Dropping it without [`FlightGuard::complete`] releases
/// followers with [`FlightOutcome::Abandoned`].
pub struct FlightGuard {
    key: String,
    flight: Arc<Flight>,
    owner: Arc<InFlight>,
}

impl FlightGuard {
    pub fn complete(self, payload: Bytes) {
        self.flight.finish(Some(payload));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flight.finish(None);
        self.owner
            .flights
            .remove_if(&self.key, |_, flight| Arc::ptr_eq(flight, &self.flight));
    }
}

pub struct FlightWaiter {
    flight: Arc<Flight>,
}

impl FlightWaiter {
    pub fn wait(self, timeout: Duration) -> FlightOutcome {
        let state = mutex_lock(&self.flight.state, SOURCE, "wait");
        let (state, _) = recover(
            self.flight
                .done
                .wait_timeout_while(state, timeout, |state| {
                    matches!(state, FlightState::Running)
                }),
            SOURCE,
            "wait",
            "condvar.wait",
        );
        match &*state {
            FlightState::Running => FlightOutcome::TimedOut,
            FlightState::Finished(Some(payload)) => FlightOutcome::Ready(payload.clone()),
            FlightState::Finished(None) => FlightOutcome::Abandoned,
        }
    }
}
