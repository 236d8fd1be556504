//! Broker acknowledgement tracking for control-topic publishes
//!
//! The client only queues a publish locally. Its packet id is assigned when
//! the event loop sends it, so waiters are matched to outgoing publishes in
//! the order the publishes were queued, then to the broker's `PubAck`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use rumqttc::{Event, Outgoing, Packet};
use tokio::sync::oneshot;

use crate::{Error, Result};

type Waiter = Option<oneshot::Sender<Result<()>>>;

#[derive(Default)]
struct State {
    /// Publishes queued on the client, not yet sent
    queued: VecDeque<Waiter>,
    /// Sent publishes awaiting `PubAck`, by packet id
    inflight: HashMap<u16, Waiter>,
    /// Unacked publishes the client will send again after reconnecting
    resends: usize,
}

/// Publish confirmations shared by the sink and the event loop
#[derive(Default)]
pub struct PublishConfirmations {
    state: Mutex<State>,
}

impl std::fmt::Debug for PublishConfirmations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishConfirmations")
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl PublishConfirmations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait slot for the publish about to be queued
    ///
    /// Callers queue publishes one at a time, in the order of their slots.
    pub fn expect(&self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut state) = self.state.lock() {
            state.queued.push_back(Some(tx));
        }
        rx
    }

    /// Drop the newest slot after its publish could not be queued
    pub fn withdraw(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.queued.pop_back();
        }
    }

    /// Feed one event loop event
    pub fn observe(&self, event: &Event) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        match event {
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                if state.resends > 0 {
                    state.resends -= 1;
                    return;
                }
                let waiter = state.queued.pop_front().flatten();
                if *pkid == 0 {
                    // QoS 0 is never acknowledged
                    if let Some(tx) = waiter {
                        let _ = tx.send(Ok(()));
                    }
                } else {
                    state.inflight.insert(*pkid, waiter);
                }
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                if let Some(Some(tx)) = state.inflight.remove(&ack.pkid) {
                    let _ = tx.send(Ok(()));
                }
            }
            _ => {}
        }
    }

    /// Fail every waiting publish after the connection dropped
    ///
    /// Queued publishes keep their place so later sends still line up with
    /// their own packets.
    pub fn fail_all(&self, reason: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let mut failed = 0;
        for slot in &mut state.queued {
            if let Some(tx) = slot.take() {
                let _ = tx.send(Err(Error::BrokerUnavailable(reason.to_string())));
                failed += 1;
            }
        }
        let inflight = std::mem::take(&mut state.inflight);
        state.resends += inflight.len();
        for tx in inflight.into_values().flatten() {
            let _ = tx.send(Err(Error::BrokerUnavailable(reason.to_string())));
            failed += 1;
        }
        if failed > 0 {
            tracing::warn!(failed, reason, "control publishes not confirmed");
        }
    }

    /// Publishes still waiting for a confirmation
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().map_or(0, |state| {
            state.queued.iter().filter(|w| w.is_some()).count()
                + state.inflight.values().filter(|w| w.is_some()).count()
        })
    }
}

#[cfg(test)]
mod tests {
    use rumqttc::PubAck;

    use super::*;

    fn sent(pkid: u16) -> Event {
        Event::Outgoing(Outgoing::Publish(pkid))
    }

    fn acked(pkid: u16) -> Event {
        Event::Incoming(Packet::PubAck(PubAck::new(pkid)))
    }

    #[tokio::test]
    async fn pub_ack_confirms_in_publish_order() {
        let confirmations = PublishConfirmations::new();
        let first = confirmations.expect();
        let second = confirmations.expect();

        confirmations.observe(&sent(1));
        confirmations.observe(&sent(2));
        confirmations.observe(&acked(2));
        assert!(second.await.unwrap().is_ok());
        assert_eq!(confirmations.waiting(), 1);

        confirmations.observe(&acked(1));
        assert!(first.await.unwrap().is_ok());
        assert_eq!(confirmations.waiting(), 0);
    }

    #[tokio::test]
    async fn dropped_connection_fails_waiters() {
        let confirmations = PublishConfirmations::new();
        let inflight = confirmations.expect();
        confirmations.observe(&sent(1));
        let queued = confirmations.expect();

        confirmations.fail_all("connection refused");
        assert!(matches!(inflight.await.unwrap(), Err(Error::BrokerUnavailable(_))));
        assert!(matches!(queued.await.unwrap(), Err(Error::BrokerUnavailable(_))));
        assert_eq!(confirmations.waiting(), 0);
    }

    #[tokio::test]
    async fn resent_publishes_do_not_confirm_new_ones() {
        let confirmations = PublishConfirmations::new();
        let _lost = confirmations.expect();
        confirmations.observe(&sent(1));
        confirmations.fail_all("connection reset");

        let fresh = confirmations.expect();
        // after reconnecting the client resends packet 1 first
        confirmations.observe(&sent(1));
        confirmations.observe(&acked(1));
        confirmations.observe(&sent(2));
        assert_eq!(confirmations.waiting(), 1);

        confirmations.observe(&acked(2));
        assert!(fresh.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn withdrawn_slot_is_not_matched() {
        let confirmations = PublishConfirmations::new();
        let kept = confirmations.expect();
        let _withdrawn = confirmations.expect();
        confirmations.withdraw();

        confirmations.observe(&sent(3));
        confirmations.observe(&acked(3));
        assert!(kept.await.unwrap().is_ok());
        assert_eq!(confirmations.waiting(), 0);
    }
}
