//! Push subscriptions held on one connection, keyed by stream kind.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::{self, StreamKind};
use crate::error::SubscriptionError;

/// An active subscription. Dropping the sink ends the consumer's stream.
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub stream: StreamKind,
    /// Venue-side id, used for `forget`
    pub id: Option<String>,
    epoch: u64,
    sink: mpsc::UnboundedSender<Value>,
}

#[derive(Debug)]
enum Slot {
    /// Subscribe request sent, no answer yet
    Reserved { epoch: u64 },
    Active(SubscriptionHandle),
}

/// Registry of the streams of one session.
///
/// Every teardown bumps the epoch. A subscribe answer that arrives for an
/// older epoch is never activated, so data from a replaced session cannot
/// reach the consumers of the new one.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    epoch: u64,
    slots: HashMap<StreamKind, Slot>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Claim the slot for `stream` before the subscribe request goes out.
    pub fn reserve(&mut self, stream: StreamKind) -> Result<u64, SubscriptionError> {
        if self.slots.contains_key(&stream) {
            return Err(SubscriptionError::AlreadyActive(stream));
        }
        self.slots.insert(stream, Slot::Reserved { epoch: self.epoch });
        Ok(self.epoch)
    }

    /// Turn a reservation into an active handle. Returns false when the
    /// reservation was torn down in the meantime.
    pub fn activate(
        &mut self,
        stream: StreamKind,
        id: Option<String>,
        epoch: u64,
        sink: mpsc::UnboundedSender<Value>,
    ) -> bool {
        match self.slots.get(&stream) {
            Some(Slot::Reserved { epoch: reserved }) if *reserved == epoch && epoch == self.epoch => {
                self.slots.insert(
                    stream,
                    Slot::Active(SubscriptionHandle {
                        stream,
                        id,
                        epoch,
                        sink,
                    }),
                );
                true
            }
            _ => false,
        }
    }

    /// Drop a reservation whose subscribe request failed.
    pub fn release(&mut self, stream: StreamKind, epoch: u64) {
        if let Some(Slot::Reserved { epoch: reserved }) = self.slots.get(&stream) {
            if *reserved == epoch {
                self.slots.remove(&stream);
            }
        }
    }

    pub fn is_current(&self, stream: StreamKind, epoch: u64) -> bool {
        matches!(self.slots.get(&stream), Some(Slot::Active(h)) if h.epoch == epoch)
    }

    pub fn is_active(&self, stream: StreamKind) -> bool {
        matches!(self.slots.get(&stream), Some(Slot::Active(_)))
    }

    pub fn active_streams(&self) -> Vec<StreamKind> {
        let mut streams: Vec<StreamKind> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Active(_)))
            .map(|(stream, _)| *stream)
            .collect();
        streams.sort();
        streams
    }

    /// Sink of the subscription a push belongs to.
    pub fn route(&self, msg: &Value) -> Option<mpsc::UnboundedSender<Value>> {
        let id = api::subscription_id(msg)?;
        self.slots.values().find_map(|slot| match slot {
            Slot::Active(h) if h.id.as_deref() == Some(id) => Some(h.sink.clone()),
            _ => None,
        })
    }

    /// Empty the registry and start a new epoch. Returns the handles that
    /// were active so the caller can `forget` them on the venue.
    pub fn take_all(&mut self) -> Vec<SubscriptionHandle> {
        self.epoch += 1;
        self.slots
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Active(h) => Some(h),
                Slot::Reserved { .. } => None,
            })
            .collect()
    }
}
