//! Delivery dispatch across a worker's consume channels.
//!
//! The dispatcher owns every delivery from receipt until disposition. The
//! worker pulls exactly one delivery at a time; the QoS prefetch window
//! bounds how many the broker pushes beyond that. Outstanding tags are
//! tracked per channel in receipt order so dispositions and the shutdown
//! drain settle oldest-first.

use futures::FutureExt;
use tracing::{debug, warn};

use drover_common::{ChannelError, Delivery};

use crate::broker::BrokerChannel;

/// A delivery handed to the worker, tagged with the channel it came from so
/// the disposition goes back to the right one.
#[derive(Debug)]
pub struct DispatchedDelivery {
    pub channel: usize,
    pub delivery: Delivery,
}

struct ChannelSlot {
    connection: String,
    channel: Box<dyn BrokerChannel>,
    outstanding: Vec<u64>,
    open: bool,
}

impl ChannelSlot {
    fn settle(&mut self, delivery_tag: u64) {
        match self.outstanding.first() {
            Some(first) if *first == delivery_tag => {
                self.outstanding.remove(0);
            }
            _ => {
                warn!(
                    connection = %self.connection,
                    delivery_tag,
                    "Out-of-order disposition"
                );
                self.outstanding.retain(|t| *t != delivery_tag);
            }
        }
    }
}

pub struct DeliveryDispatcher {
    slots: Vec<ChannelSlot>,
    auto_ack: bool,
}

impl DeliveryDispatcher {
    pub fn new(channels: Vec<(String, Box<dyn BrokerChannel>)>, auto_ack: bool) -> Self {
        let slots = channels
            .into_iter()
            .map(|(connection, channel)| ChannelSlot {
                connection,
                channel,
                outstanding: Vec::new(),
                open: true,
            })
            .collect();
        Self { slots, auto_ack }
    }

    /// Register consumption on every channel. Consumer tags are suffixed
    /// with the channel index so each registration is unique.
    pub async fn start(&mut self, queue: &str, tag_base: &str) -> Result<(), ChannelError> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let tag = format!("{}-{}", tag_base, idx);
            slot.channel.consume(queue, &tag, self.auto_ack).await?;
        }
        Ok(())
    }

    /// Pull the next delivery from whichever channel produces one first.
    ///
    /// `None` means every channel's stream has ended; `Some(Err(..))` is a
    /// channel failure. Both send the worker through its restart path.
    /// Cancel-safe: no delivery is lost when this future is dropped.
    pub async fn next(&mut self) -> Option<Result<DispatchedDelivery, ChannelError>> {
        loop {
            let pulls: Vec<_> = self
                .slots
                .iter_mut()
                .enumerate()
                .filter(|(_, slot)| slot.open)
                .map(|(idx, slot)| {
                    async move { (idx, slot.channel.next_delivery().await) }.boxed()
                })
                .collect();
            if pulls.is_empty() {
                return None;
            }

            let ((idx, item), _, _) = futures::future::select_all(pulls).await;
            match item {
                None => {
                    debug!(
                        connection = %self.slots[idx].connection,
                        "Consume stream ended"
                    );
                    self.slots[idx].open = false;
                }
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(delivery)) => {
                    if !self.auto_ack {
                        self.slots[idx].outstanding.push(delivery.delivery_tag);
                    }
                    return Some(Ok(DispatchedDelivery {
                        channel: idx,
                        delivery,
                    }));
                }
            }
        }
    }

    pub async fn ack(&mut self, channel: usize, delivery_tag: u64) -> Result<(), ChannelError> {
        if self.auto_ack {
            return Ok(());
        }
        let slot = &mut self.slots[channel];
        slot.settle(delivery_tag);
        slot.channel.ack(delivery_tag).await
    }

    pub async fn reject(
        &mut self,
        channel: usize,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), ChannelError> {
        if self.auto_ack {
            return Ok(());
        }
        let slot = &mut self.slots[channel];
        slot.settle(delivery_tag);
        slot.channel.reject(delivery_tag, requeue).await
    }

    /// Count of received-but-undisposed deliveries across all channels.
    pub fn outstanding(&self) -> usize {
        self.slots.iter().map(|s| s.outstanding.len()).sum()
    }

    /// Release everything and tear the channels down: nack all outstanding
    /// deliveries in one multiple-flag rejection per channel, cancel the
    /// consumers, close the channels. Errors are logged, never propagated;
    /// this runs on shutdown and restart paths that must complete.
    pub async fn drain(&mut self, requeue: bool) {
        for slot in &mut self.slots {
            if let Some(last) = slot.outstanding.last().copied() {
                debug!(
                    connection = %slot.connection,
                    outstanding = slot.outstanding.len(),
                    requeue,
                    "Releasing outstanding deliveries"
                );
                if let Err(e) = slot.channel.reject_up_to(last, requeue).await {
                    warn!(
                        connection = %slot.connection,
                        error = %e,
                        "Drain rejection failed"
                    );
                }
                slot.outstanding.clear();
            }
            slot.channel.cancel().await;
            slot.channel.close().await;
            slot.open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerChannel, ChannelOptions};
    use crate::testing::{delivery, BrokerEvent, MockBroker, ScriptItem};
    use drover_common::ConnectionSpec;
    use std::sync::Arc;

    async fn consume_channel(broker: &Arc<MockBroker>, name: &str) -> Box<dyn BrokerChannel> {
        let connection = broker
            .connect(name, &ConnectionSpec::default())
            .await
            .unwrap();
        connection
            .open_channel(ChannelOptions {
                prefetch: 10,
                confirm_mode: false,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn tracks_and_settles_in_receipt_order() {
        let broker = MockBroker::new();
        broker.push_batch(
            "main",
            vec![
                ScriptItem::Deliver(delivery(1)),
                ScriptItem::Deliver(delivery(2)),
            ],
        );
        let channel = consume_channel(&broker, "main").await;
        let mut dispatcher = DeliveryDispatcher::new(vec![("main".to_string(), channel)], false);
        dispatcher.start("q", "t").await.unwrap();

        let first = dispatcher.next().await.unwrap().unwrap();
        let second = dispatcher.next().await.unwrap().unwrap();
        assert_eq!(first.delivery.delivery_tag, 1);
        assert_eq!(second.delivery.delivery_tag, 2);
        assert_eq!(dispatcher.outstanding(), 2);

        dispatcher.ack(first.channel, 1).await.unwrap();
        dispatcher
            .reject(second.channel, 2, true)
            .await
            .unwrap();
        assert_eq!(dispatcher.outstanding(), 0);
        assert_eq!(broker.acked_tags(), vec![1]);
        assert_eq!(broker.nacks(), vec![(2, true, false)]);
    }

    #[tokio::test]
    async fn closed_streams_end_the_dispatcher() {
        let broker = MockBroker::new();
        broker.push_batch("main", vec![ScriptItem::Close]);
        let channel = consume_channel(&broker, "main").await;
        let mut dispatcher = DeliveryDispatcher::new(vec![("main".to_string(), channel)], false);
        dispatcher.start("q", "t").await.unwrap();

        assert!(dispatcher.next().await.is_none());
    }

    #[tokio::test]
    async fn channel_errors_surface() {
        let broker = MockBroker::new();
        broker.push_batch("main", vec![ScriptItem::Fail("boom".to_string())]);
        let channel = consume_channel(&broker, "main").await;
        let mut dispatcher = DeliveryDispatcher::new(vec![("main".to_string(), channel)], false);
        dispatcher.start("q", "t").await.unwrap();

        let item = dispatcher.next().await.unwrap();
        assert!(item.is_err());
    }

    #[tokio::test]
    async fn drain_releases_everything_once() {
        let broker = MockBroker::new();
        broker.push_batch(
            "main",
            vec![
                ScriptItem::Deliver(delivery(7)),
                ScriptItem::Deliver(delivery(8)),
            ],
        );
        let channel = consume_channel(&broker, "main").await;
        let mut dispatcher = DeliveryDispatcher::new(vec![("main".to_string(), channel)], false);
        dispatcher.start("q", "t").await.unwrap();

        dispatcher.next().await.unwrap().unwrap();
        dispatcher.next().await.unwrap().unwrap();
        dispatcher.drain(true).await;

        assert_eq!(dispatcher.outstanding(), 0);
        // One multiple-flag nack up to the newest tag, then cancel + close.
        assert_eq!(broker.nacks(), vec![(8, true, true)]);
        let events = broker.events();
        assert!(events.contains(&BrokerEvent::Cancelled {
            connection: "main".to_string()
        }));
        assert!(events.contains(&BrokerEvent::ChannelClosed {
            connection: "main".to_string()
        }));
    }

    #[tokio::test]
    async fn auto_ack_skips_the_ledger() {
        let broker = MockBroker::new();
        broker.push_batch("main", vec![ScriptItem::Deliver(delivery(3))]);
        let channel = consume_channel(&broker, "main").await;
        let mut dispatcher = DeliveryDispatcher::new(vec![("main".to_string(), channel)], true);
        dispatcher.start("q", "t").await.unwrap();

        let item = dispatcher.next().await.unwrap().unwrap();
        assert_eq!(item.delivery.delivery_tag, 3);
        assert_eq!(dispatcher.outstanding(), 0);

        dispatcher.ack(item.channel, 3).await.unwrap();
        assert!(broker.acked_tags().is_empty());

        // Consume was registered in auto-ack mode.
        assert!(broker.events().iter().any(|e| matches!(
            e,
            BrokerEvent::ConsumeStarted { auto_ack: true, .. }
        )));
    }

    #[tokio::test]
    async fn outstanding_stays_within_prefetch_window() {
        // With QoS prefetch 2 the broker never has more than two
        // unacknowledged deliveries in flight; the ledger mirrors that
        // window as the worker pulls and settles.
        let prefetch = 2usize;
        let broker = MockBroker::new();
        broker.push_batch(
            "main",
            vec![
                ScriptItem::Deliver(delivery(1)),
                ScriptItem::Deliver(delivery(2)),
                ScriptItem::Deliver(delivery(3)),
            ],
        );
        let channel = consume_channel(&broker, "main").await;
        let mut dispatcher = DeliveryDispatcher::new(vec![("main".to_string(), channel)], false);
        dispatcher.start("q", "t").await.unwrap();

        dispatcher.next().await.unwrap().unwrap();
        dispatcher.next().await.unwrap().unwrap();
        assert_eq!(dispatcher.outstanding(), prefetch);

        // The window only reopens once the oldest delivery is settled.
        dispatcher.ack(0, 1).await.unwrap();
        assert_eq!(dispatcher.outstanding(), 1);
        dispatcher.next().await.unwrap().unwrap();
        assert_eq!(dispatcher.outstanding(), prefetch);

        dispatcher.ack(0, 2).await.unwrap();
        dispatcher.ack(0, 3).await.unwrap();
        assert_eq!(dispatcher.outstanding(), 0);
        assert_eq!(broker.acked_tags(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn pulls_from_multiple_channels() {
        let broker = MockBroker::new();
        broker.push_batch("a", vec![ScriptItem::Deliver(delivery(1))]);
        broker.push_batch("b", vec![ScriptItem::Deliver(delivery(2))]);
        let ca = consume_channel(&broker, "a").await;
        let cb = consume_channel(&broker, "b").await;
        let mut dispatcher = DeliveryDispatcher::new(
            vec![("a".to_string(), ca), ("b".to_string(), cb)],
            false,
        );
        dispatcher.start("q", "t").await.unwrap();

        let mut tags = vec![
            dispatcher.next().await.unwrap().unwrap().delivery.delivery_tag,
            dispatcher.next().await.unwrap().unwrap().delivery.delivery_tag,
        ];
        tags.sort_unstable();
        assert_eq!(tags, vec![1, 2]);
        assert_eq!(dispatcher.outstanding(), 2);
    }
}
