//! In-memory message bus for tests/dev.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use claimflow_core::QueueEntryId;

use crate::bus::{BusError, ConsumedMessage, DispatchReceipt, MessageBus};
use crate::envelope::DispatchEnvelope;

/// When a sent envelope becomes visible to `drain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Delivered as soon as it is acknowledged.
    #[default]
    Immediate,
    /// Held in flight until `deliver`/`deliver_all` is called.
    Manual,
}

#[derive(Debug, Default)]
struct BusState {
    sent: Vec<DispatchEnvelope>,
    in_flight: Vec<DispatchEnvelope>,
    delivered: VecDeque<ConsumedMessage>,
    send_attempts: usize,
    failing_sends: HashSet<usize>,
    unreachable: bool,
    drains: usize,
    next_sequence: u64,
}

impl BusState {
    fn deliver(&mut self, envelope: DispatchEnvelope) {
        self.next_sequence += 1;
        self.delivered.push_back(ConsumedMessage {
            delivery_id: format!("mem-{}", self.next_sequence),
            envelope,
            delivered_at: Utc::now(),
        });
    }
}

/// In-memory bus.
///
/// - No IO
/// - FIFO delivery
/// - Fault injection for dispatch failure paths (`fail_send_number`, `set_unreachable`)
#[derive(Debug, Default)]
pub struct InMemoryMessageBus {
    mode: DeliveryMode,
    state: Mutex<BusState>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus that holds every message in flight until explicitly delivered.
    pub fn manual() -> Self {
        Self {
            mode: DeliveryMode::Manual,
            state: Mutex::new(BusState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject the `n`-th send attempt (1-based, counted across the bus lifetime).
    pub fn fail_send_number(&self, n: usize) {
        self.lock().failing_sends.insert(n);
    }

    /// Make every send fail as if the transport were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Deliver the in-flight message for a queue entry. Returns false if none was in flight.
    pub fn deliver(&self, entry_id: QueueEntryId) -> bool {
        let mut state = self.lock();
        match state
            .in_flight
            .iter()
            .position(|e| e.queue_entry_id() == entry_id)
        {
            Some(idx) => {
                let envelope = state.in_flight.remove(idx);
                state.deliver(envelope);
                true
            }
            None => false,
        }
    }

    /// Deliver everything in flight, in send order.
    pub fn deliver_all(&self) -> usize {
        let mut state = self.lock();
        let in_flight = std::mem::take(&mut state.in_flight);
        let count = in_flight.len();
        for envelope in in_flight {
            state.deliver(envelope);
        }
        count
    }

    /// Push an arbitrary envelope straight into the delivered queue.
    pub fn inject(&self, envelope: DispatchEnvelope) {
        self.lock().deliver(envelope);
    }

    /// Every envelope the bus acknowledged, in send order.
    pub fn sent(&self) -> Vec<DispatchEnvelope> {
        self.lock().sent.clone()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn delivered_len(&self) -> usize {
        self.lock().delivered.len()
    }

    /// Number of `drain` calls served so far.
    pub fn drain_count(&self) -> usize {
        self.lock().drains
    }
}

#[async_trait::async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn send(&self, envelope: DispatchEnvelope) -> Result<DispatchReceipt, BusError> {
        let mut state = self.state.lock().map_err(|_| BusError::Poisoned)?;
        state.send_attempts += 1;

        if state.unreachable {
            return Err(BusError::Unreachable("in-memory bus marked unreachable".to_string()));
        }
        let attempt = state.send_attempts;
        if state.failing_sends.contains(&attempt) {
            return Err(BusError::Rejected(format!("send #{attempt} rejected")));
        }

        let receipt = DispatchReceipt {
            message_id: envelope.message_id(),
            transport_id: format!("mem-send-{attempt}"),
            accepted_at: Utc::now(),
        };

        state.sent.push(envelope.clone());
        match self.mode {
            DeliveryMode::Immediate => state.deliver(envelope),
            DeliveryMode::Manual => state.in_flight.push(envelope),
        }

        Ok(receipt)
    }

    async fn drain(&self, max: usize) -> Result<Vec<ConsumedMessage>, BusError> {
        let mut state = self.state.lock().map_err(|_| BusError::Poisoned)?;
        state.drains += 1;
        let take = max.min(state.delivered.len());
        Ok(state.delivered.drain(..take).collect())
    }
}
