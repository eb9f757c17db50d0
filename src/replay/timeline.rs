//! Timeline Reconstructor
//!
//! Merges orders (at submit time) and fills (at execution time) into one
//! ascending event sequence. Ties resolve Order before Fill, then by the
//! engine's emission order.

use crate::replay::clock::Nanos;
use crate::replay::events::{FillRecord, OrderRecord};
use serde::{Deserialize, Serialize};

pub const MAX_PAGE_LIMIT: usize = 10_000;
pub const DEFAULT_PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimelineKind {
    Order,
    Fill,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimelinePayload {
    Order(OrderRecord),
    Fill(FillRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp_ns: Nanos,
    pub kind: TimelineKind,
    /// Position in the timeline.
    pub sequence: u64,
    pub payload: TimelinePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinePage {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
    pub events: Vec<TimelineEvent>,
}

/// Ordered, immutable run timeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeline {
    events: Vec<TimelineEvent>,
}

impl Timeline {
    pub fn build(orders: &[OrderRecord], fills: &[FillRecord]) -> Self {
        let mut events: Vec<TimelineEvent> = orders
            .iter()
            .map(|o| TimelineEvent {
                timestamp_ns: o.submitted_at_ns,
                kind: TimelineKind::Order,
                sequence: 0,
                payload: TimelinePayload::Order(o.clone()),
            })
            .chain(fills.iter().map(|f| TimelineEvent {
                timestamp_ns: f.ts_event_ns,
                kind: TimelineKind::Fill,
                sequence: 0,
                payload: TimelinePayload::Fill(f.clone()),
            }))
            .collect();

        // Stable: equal keys keep emission order.
        events.sort_by_key(|e| (e.timestamp_ns, e.kind));
        for (i, event) in events.iter_mut().enumerate() {
            event.sequence = i as u64;
        }
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Slice of the timeline. `limit` is clamped to `[1, MAX_PAGE_LIMIT]`.
    pub fn page(&self, offset: usize, limit: usize) -> TimelinePage {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let total = self.events.len();
        let start = offset.min(total);
        let end = start.saturating_add(limit).min(total);
        TimelinePage {
            total,
            offset,
            limit,
            has_more: end < total,
            events: self.events[start..end].to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::events::{LiquiditySide, OrderStatus, OrderType, Side};

    fn order(id: u64, ts: Nanos) -> OrderRecord {
        OrderRecord {
            order_id: id,
            client_order_id: format!("c{}", id),
            instrument_id: "A.X".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: 1.0,
            price: 100.0,
            status: OrderStatus::Filled,
            reject_reason: None,
            submitted_at_ns: ts,
            last_update_ns: ts,
        }
    }

    fn fill(id: u64, order_id: u64, ts: Nanos) -> FillRecord {
        FillRecord {
            fill_id: id,
            order_id,
            instrument_id: "A.X".into(),
            side: Side::Buy,
            quantity: 1.0,
            price: 100.0,
            commission: 0.01,
            liquidity: LiquiditySide::Taker,
            ts_event_ns: ts,
            closing: false,
        }
    }

    #[test]
    fn test_merge_order_and_ties() {
        let orders = vec![order(1, 10), order(2, 20), order(3, 20)];
        let fills = vec![fill(1, 1, 20), fill(2, 2, 15), fill(3, 3, 20)];
        let timeline = Timeline::build(&orders, &fills);

        assert_eq!(timeline.len(), 6);
        let keys: Vec<(Nanos, TimelineKind)> = timeline
            .events()
            .iter()
            .map(|e| (e.timestamp_ns, e.kind))
            .collect();
        assert_eq!(
            keys,
            vec![
                (10, TimelineKind::Order),
                (15, TimelineKind::Fill),
                (20, TimelineKind::Order),
                (20, TimelineKind::Order),
                (20, TimelineKind::Fill),
                (20, TimelineKind::Fill),
            ]
        );
        // Emission order among ties.
        match (&timeline.events()[2].payload, &timeline.events()[5].payload) {
            (TimelinePayload::Order(o), TimelinePayload::Fill(f)) => {
                assert_eq!(o.order_id, 2);
                assert_eq!(f.fill_id, 3);
            }
            other => panic!("unexpected payloads {:?}", other),
        }
        assert!(timeline
            .events()
            .iter()
            .enumerate()
            .all(|(i, e)| e.sequence == i as u64));
    }

    #[test]
    fn test_build_is_reproducible() {
        let orders: Vec<_> = (0..50).map(|i| order(i, (i % 7) as Nanos)).collect();
        let fills: Vec<_> = (0..50).map(|i| fill(i, i, (i % 5) as Nanos)).collect();
        let a = serde_json::to_string(&Timeline::build(&orders, &fills)).unwrap();
        let b = serde_json::to_string(&Timeline::build(&orders, &fills)).unwrap();
        assert_eq!(a, b);
        let back: Timeline = serde_json::from_str(&a).unwrap();
        assert_eq!(back.len(), 100);
        assert_eq!(back, Timeline::build(&orders, &fills));
    }

    #[test]
    fn test_pagination() {
        let orders: Vec<_> = (0..25).map(|i| order(i, i as Nanos)).collect();
        let timeline = Timeline::build(&orders, &[]);

        let page = timeline.page(0, 10);
        assert_eq!(page.events.len(), 10);
        assert!(page.has_more);
        assert_eq!(page.total, 25);

        let page = timeline.page(20, 10);
        assert_eq!(page.events.len(), 5);
        assert!(!page.has_more);
        assert_eq!(page.events[0].sequence, 20);

        let page = timeline.page(100, 10);
        assert!(page.events.is_empty());
        assert!(!page.has_more);

        assert_eq!(timeline.page(0, 0).limit, 1);
        assert_eq!(timeline.page(0, usize::MAX).limit, MAX_PAGE_LIMIT);
    }

    #[test]
    fn test_empty_timeline() {
        let timeline = Timeline::build(&[], &[]);
        assert!(timeline.is_empty());
        assert_eq!(timeline.page(0, 10).total, 0);
    }
}
