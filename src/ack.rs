//! Per-channel ACK correlation: id allocation and single-shot reply slots.
//!
//! Every allocated id is eventually delivered, timed out, or cancelled on
//! channel close; never leaked, never delivered twice. The slot is a
//! `oneshot` sender: removing it from the map and dropping it wakes the
//! parked caller with a closed error.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::Error;

#[derive(Default)]
pub struct AckRegistry {
    counter: AtomicU64,
    waiters: DashMap<u64, oneshot::Sender<Value>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next outbound ack id. Ids start at 1; 0 means "no ack"
    /// on the wire.
    pub fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register `tx` as the unique recipient for `id`.
    pub fn park(&self, id: u64, tx: oneshot::Sender<Value>) {
        self.waiters.insert(id, tx);
    }

    /// Hand `value` to the waiter for `id`, exactly once, removing the
    /// registration. Errs with `WaiterNotFound` when nothing is parked.
    pub fn deliver(&self, id: u64, value: Value) -> Result<(), Error> {
        let (_, tx) = self.waiters.remove(&id).ok_or(Error::WaiterNotFound(id))?;
        // The caller may have raced a timeout and dropped its receiver.
        let _ = tx.send(value);
        Ok(())
    }

    /// Remove a registration; a later `deliver` for this id is a no-op.
    pub fn cancel(&self, id: u64) {
        self.waiters.remove(&id);
    }

    /// Drop every parked slot, waking all waiters with a closed error.
    pub fn fail_all(&self) {
        self.waiters.clear();
    }

    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ids_start_at_one_and_increase() {
        let acks = AckRegistry::new();
        assert_eq!(acks.next_id(), 1);
        assert_eq!(acks.next_id(), 2);
        assert_eq!(acks.next_id(), 3);
    }

    #[tokio::test]
    async fn deliver_exactly_once() {
        let acks = AckRegistry::new();
        let id = acks.next_id();
        let (tx, rx) = oneshot::channel();
        acks.park(id, tx);

        acks.deliver(id, json!(["ok"])).unwrap();
        assert_eq!(rx.await.unwrap(), json!(["ok"]));
        assert_eq!(acks.pending(), 0);

        // Second delivery finds no waiter.
        assert!(matches!(
            acks.deliver(id, json!("again")),
            Err(Error::WaiterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_before_deliver_does_not_leak() {
        let acks = AckRegistry::new();
        let id = acks.next_id();
        let (tx, rx) = oneshot::channel();
        acks.park(id, tx);

        acks.cancel(id);
        assert_eq!(acks.pending(), 0);
        assert!(matches!(
            acks.deliver(id, json!(1)),
            Err(Error::WaiterNotFound(_))
        ));
        // The parked caller observes the slot going away.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn fail_all_wakes_every_waiter() {
        let acks = AckRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let id = acks.next_id();
            let (tx, rx) = oneshot::channel();
            acks.park(id, tx);
            receivers.push(rx);
        }

        acks.fail_all();
        assert_eq!(acks.pending(), 0);
        for rx in receivers {
            assert!(rx.await.is_err());
        }
    }
}
