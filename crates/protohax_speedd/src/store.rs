//! Shared state across all connections: observations, limits, the
//! ticketed-day ledger, pending tickets, and dispatcher subscriptions.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::msg::Ticket;

/// Seconds per calendar day; a timestamp's day is `timestamp / DAY_SECS`.
pub const DAY_SECS: u32 = 86_400;

/// Measured speed must exceed the limit by more than this to draw a
/// ticket, absorbing rounding in the average-speed computation.
const TOLERANCE_MPH: f64 = 0.3;

/// One camera observation of a plate on a road.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    /// Mile marker of the observing camera.
    pub mile: u16,
    /// Observation time, in seconds.
    pub timestamp: u32,
}

/// The store every connection task shares.
///
/// All state sits behind one mutex. Nothing here ever touches a socket:
/// delivering a ticket means depositing it into a subscriber's channel
/// endpoint, and the subscriber's own connection task writes it out after
/// the lock is long gone.
#[derive(Debug, Default)]
pub struct Store {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Speed limit per road, in miles per hour.
    limits: AHashMap<u16, u16>,
    /// Per plate, per road: observations sorted by timestamp.
    readings: AHashMap<Bytes, AHashMap<u16, Vec<Reading>>>,
    /// Per plate: calendar days already covered by an issued ticket.
    ticket_days: AHashMap<Bytes, AHashSet<u32>>,
    /// Per road: tickets issued but not yet handed to any dispatcher.
    pending: AHashMap<u16, VecDeque<Ticket>>,
    /// Per road: endpoints of the dispatchers responsible for it.
    subscribers: AHashMap<u16, Vec<Subscriber>>,
}

#[derive(Debug)]
struct Subscriber {
    /// Connection the endpoint belongs to, for unsubscription.
    conn: u64,
    tx: mpsc::UnboundedSender<Ticket>,
}

impl Store {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the speed limit a camera declared for its road.
    pub fn register_camera(&self, road: u16, limit: u16) {
        self.lock().limits.insert(road, limit);
    }

    /// Records a plate observation and issues whatever tickets it proves.
    ///
    /// The observation is inserted into the plate's per-road list, sorted
    /// by timestamp - cameras' clocks are not synchronised with arrival
    /// order. Every adjacent pair in the sorted list is then checked:
    /// above the limit (plus tolerance) and with none of its calendar days
    /// ticketed yet, it becomes a pending ticket and every day it spans is
    /// marked in the ledger. Pairs whose days are already covered are
    /// dropped for good.
    pub fn record_plate(&self, plate: &Bytes, road: u16, mile: u16, timestamp: u32) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(&limit) = inner.limits.get(&road) else {
            // plates only come from identified cameras, which register
            // their road's limit first
            return;
        };

        let list = inner
            .readings
            .entry(plate.clone())
            .or_default()
            .entry(road)
            .or_default();
        let at = list.partition_point(|r| r.timestamp <= timestamp);
        list.insert(at, Reading { mile, timestamp });
        trace!(
            "Plate {:?} seen on road {road} at mile {mile}, t={timestamp}",
            PlateDisplay(plate),
        );

        // re-checking old pairs is fine: their days are in the ledger
        let speeding: Vec<(Reading, Reading, u16)> = list
            .windows(2)
            .filter_map(|pair| measure(pair[0], pair[1], limit).map(|cs| (pair[0], pair[1], cs)))
            .collect();

        for (r1, r2, speed) in speeding {
            let days = (r1.timestamp / DAY_SECS)..=(r2.timestamp / DAY_SECS);
            let ledger = inner.ticket_days.entry(plate.clone()).or_default();
            if days.clone().any(|day| ledger.contains(&day)) {
                continue;
            }
            ledger.extend(days);

            debug!(
                "Ticketing {:?} on road {road}: {}.{:02} mph over miles {}..{}",
                PlateDisplay(plate),
                speed / 100,
                speed % 100,
                r1.mile,
                r2.mile,
            );
            inner.pending.entry(road).or_default().push_back(Ticket {
                plate: plate.clone(),
                road,
                mile1: r1.mile,
                timestamp1: r1.timestamp,
                mile2: r2.mile,
                timestamp2: r2.timestamp,
                speed,
            });
        }

        dispatch(inner, road);
    }

    /// Registers connection `conn` as a dispatcher for `roads`, handing it
    /// the endpoint tickets will be deposited into.
    ///
    /// Tickets already pending for those roads are drained to it
    /// immediately, oldest first.
    pub fn subscribe(&self, conn: u64, roads: &[u16], tx: &mpsc::UnboundedSender<Ticket>) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        for road in dedup(roads) {
            inner.subscribers.entry(road).or_default().push(Subscriber {
                conn,
                tx: tx.clone(),
            });
            dispatch(inner, road);
        }
    }

    /// Removes every endpoint connection `conn` deposited for `roads`.
    pub fn unsubscribe(&self, conn: u64, roads: &[u16]) {
        let mut guard = self.lock();
        for road in dedup(roads) {
            if let Some(subs) = guard.subscribers.get_mut(&road) {
                subs.retain(|sub| sub.conn != conn);
            }
        }
    }

    /// Returns tickets a dispatcher took delivery of but never wrote out,
    /// putting them back at the head of their queues for someone else.
    ///
    /// `tickets` must be in the order they were received. The caller must
    /// have unsubscribed first, or the tickets can bounce straight back.
    pub fn restore(&self, tickets: Vec<Ticket>) {
        if tickets.is_empty() {
            return;
        }
        let mut guard = self.lock();
        let inner = &mut *guard;

        let mut roads = Vec::new();
        for ticket in tickets.into_iter().rev() {
            if !roads.contains(&ticket.road) {
                roads.push(ticket.road);
            }
            inner
                .pending
                .entry(ticket.road)
                .or_default()
                .push_front(ticket);
        }
        for road in roads {
            dispatch(inner, road);
        }
    }
}

/// Drains `road`'s pending tickets into its subscribers, first come first
/// served.
///
/// A ticket is consumed by the first endpoint that accepts it; endpoints
/// whose connection has gone away are discarded along the way. With no
/// usable endpoint left, tickets stay queued.
fn dispatch(inner: &mut Inner, road: u16) {
    let Some(queue) = inner.pending.get_mut(&road) else {
        return;
    };
    let Some(subs) = inner.subscribers.get_mut(&road) else {
        return;
    };

    while let Some(mut ticket) = queue.pop_front() {
        loop {
            let Some(sub) = subs.first() else {
                queue.push_front(ticket);
                return;
            };
            match sub.tx.send(ticket) {
                Ok(()) => break,
                Err(mpsc::error::SendError(returned)) => {
                    // connection died without unsubscribing yet
                    ticket = returned;
                    subs.remove(0);
                }
            }
        }
    }
}

/// Average speed of the pair in hundredths of mph, if it is a speeding
/// violation.
fn measure(r1: Reading, r2: Reading, limit: u16) -> Option<u16> {
    let elapsed = r2.timestamp - r1.timestamp;
    if elapsed == 0 {
        return None;
    }
    let distance = f64::from(r1.mile.abs_diff(r2.mile));
    let speed_mph = distance / f64::from(elapsed) * 3600.0;
    if speed_mph <= f64::from(limit) + TOLERANCE_MPH {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    // `as` saturates floats, which is exactly the wire behavior we want
    Some((speed_mph * 100.0).floor().min(f64::from(u16::MAX)) as u16)
}

/// Iterates `roads` with duplicates removed, keeping first-seen order.
fn dedup(roads: &[u16]) -> impl Iterator<Item = u16> + '_ {
    let mut seen = AHashSet::new();
    roads.iter().copied().filter(move |road| seen.insert(*road))
}

/// Lossy display wrapper for plates, which are raw bytes on the wire.
struct PlateDisplay<'a>(&'a Bytes);

impl std::fmt::Debug for PlateDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.0))
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;

    const ROAD: u16 = 42;

    fn plate(name: &'static str) -> Bytes {
        Bytes::from_static(name.as_bytes())
    }

    fn subscriber(
        store: &Store,
        conn: u64,
        roads: &[u16],
    ) -> mpsc::UnboundedReceiver<Ticket> {
        let (tx, rx) = mpsc::unbounded_channel();
        store.subscribe(conn, roads, &tx);
        rx
    }

    #[test]
    fn issues_ticket_for_speeding_pair() {
        let store = Store::new();
        store.register_camera(ROAD, 100);
        let mut rx = subscriber(&store, 1, &[ROAD]);

        store.record_plate(&plate("FOO"), ROAD, 1587, 716_847);
        store.record_plate(&plate("FOO"), ROAD, 1597, 717_147);

        // 10 miles in 300 seconds = 120 mph
        assert_eq!(
            rx.try_recv().unwrap(),
            Ticket {
                plate: plate("FOO"),
                road: ROAD,
                mile1: 1587,
                timestamp1: 716_847,
                mile2: 1597,
                timestamp2: 717_147,
                speed: 12_000,
            },
        );
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn no_ticket_at_or_below_limit() {
        let store = Store::new();
        store.register_camera(ROAD, 60);
        let mut rx = subscriber(&store, 1, &[ROAD]);

        // exactly at the limit
        store.record_plate(&plate("SLO"), ROAD, 0, 0);
        store.record_plate(&plate("SLO"), ROAD, 60, 3600);
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);

        // above the limit but within tolerance: 601 miles in 10 hours
        store.record_plate(&plate("EDG"), ROAD, 0, 0);
        store.record_plate(&plate("EDG"), ROAD, 601, 36_000);
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn ticket_just_past_tolerance() {
        let store = Store::new();
        store.register_camera(ROAD, 60);
        let mut rx = subscriber(&store, 1, &[ROAD]);

        // 121 miles in 2 hours = 60.5 mph
        store.record_plate(&plate("FST"), ROAD, 0, 0);
        store.record_plate(&plate("FST"), ROAD, 121, 7200);
        assert_eq!(rx.try_recv().unwrap().speed, 6050);
    }

    #[test]
    fn reverse_direction_uses_absolute_distance() {
        let store = Store::new();
        store.register_camera(ROAD, 100);
        let mut rx = subscriber(&store, 1, &[ROAD]);

        store.record_plate(&plate("REV"), ROAD, 1597, 716_847);
        store.record_plate(&plate("REV"), ROAD, 1587, 717_147);

        let ticket = rx.try_recv().unwrap();
        assert_eq!((ticket.mile1, ticket.mile2), (1597, 1587));
        assert_eq!(ticket.speed, 12_000);
    }

    #[test]
    fn simultaneous_readings_are_skipped() {
        let store = Store::new();
        store.register_camera(ROAD, 10);
        let mut rx = subscriber(&store, 1, &[ROAD]);

        store.record_plate(&plate("TWIN"), ROAD, 0, 1000);
        store.record_plate(&plate("TWIN"), ROAD, 50, 1000);
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn out_of_order_arrival_pairs_by_timestamp() {
        let store = Store::new();
        store.register_camera(ROAD, 50);
        let mut rx = subscriber(&store, 1, &[ROAD]);

        // arrives later, happened earlier
        store.record_plate(&plate("OOO"), ROAD, 20, 1200);
        store.record_plate(&plate("OOO"), ROAD, 0, 600);

        let ticket = rx.try_recv().unwrap();
        assert_eq!((ticket.timestamp1, ticket.timestamp2), (600, 1200));
        assert_eq!((ticket.mile1, ticket.mile2), (0, 20));
        // 20 miles in 600 seconds = 120 mph
        assert_eq!(ticket.speed, 12_000);
    }

    #[test]
    fn one_ticket_per_plate_per_day() {
        let store = Store::new();
        store.register_camera(ROAD, 10);
        let mut rx = subscriber(&store, 1, &[ROAD]);

        let day_start = 8297 * DAY_SECS;
        store.record_plate(&plate("DAY"), ROAD, 0, day_start + 100);
        store.record_plate(&plate("DAY"), ROAD, 100, day_start + 200);
        assert!(rx.try_recv().is_ok());

        // still speeding, still day 8297: the ledger blocks it
        store.record_plate(&plate("DAY"), ROAD, 200, day_start + 300);
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);

        // a different plate on the same day is unaffected
        store.record_plate(&plate("OTHER"), ROAD, 0, day_start + 100);
        store.record_plate(&plate("OTHER"), ROAD, 100, day_start + 200);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn multi_day_ticket_blocks_both_days() {
        let store = Store::new();
        store.register_camera(ROAD, 10);
        let mut rx = subscriber(&store, 1, &[ROAD]);

        // spans the boundary between day 9 and day 10
        let boundary = 10 * DAY_SECS;
        store.record_plate(&plate("SPAN"), ROAD, 0, boundary - 100);
        store.record_plate(&plate("SPAN"), ROAD, 100, boundary + 100);
        assert!(rx.try_recv().is_ok());

        // entirely within day 10, already covered
        store.record_plate(&plate("SPAN"), ROAD, 200, boundary + 7200);
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn tickets_wait_for_a_late_dispatcher() {
        let store = Store::new();
        store.register_camera(ROAD, 100);

        store.record_plate(&plate("FOO"), ROAD, 1587, 716_847);
        store.record_plate(&plate("FOO"), ROAD, 1597, 717_147);

        // nobody is subscribed yet; the ticket is retained
        let mut rx = subscriber(&store, 1, &[ROAD]);
        assert_eq!(rx.try_recv().unwrap().speed, 12_000);
    }

    #[test]
    fn ticket_goes_to_exactly_one_dispatcher() {
        let store = Store::new();
        store.register_camera(ROAD, 100);
        let mut rx1 = subscriber(&store, 1, &[ROAD]);
        let mut rx2 = subscriber(&store, 2, &[ROAD]);

        store.record_plate(&plate("ONE"), ROAD, 0, 0);
        store.record_plate(&plate("ONE"), ROAD, 100, 600);

        assert!(rx1.try_recv().is_ok());
        assert_eq!(rx1.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(rx2.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn dead_endpoint_is_skipped() {
        let store = Store::new();
        store.register_camera(ROAD, 100);

        let rx1 = subscriber(&store, 1, &[ROAD]);
        drop(rx1);

        store.record_plate(&plate("DED"), ROAD, 0, 0);
        store.record_plate(&plate("DED"), ROAD, 100, 600);

        // the dead endpoint was discarded and the ticket kept; a live
        // dispatcher picks it up
        let mut rx2 = subscriber(&store, 2, &[ROAD]);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn restore_requeues_at_the_head_in_order() {
        let store = Store::new();
        store.register_camera(ROAD, 100);

        // three tickets across three days
        for day in 0..3u32 {
            let t0 = day * DAY_SECS + 100;
            store.record_plate(&plate("Q"), ROAD, 0, t0);
            store.record_plate(&plate("Q"), ROAD, 100, t0 + 600);
        }

        // first dispatcher takes all three but writes none
        let mut rx1 = subscriber(&store, 1, &[ROAD]);
        let mut taken = Vec::new();
        while let Ok(ticket) = rx1.try_recv() {
            taken.push(ticket);
        }
        assert_eq!(taken.len(), 3);
        store.unsubscribe(1, &[ROAD]);
        drop(rx1);
        store.restore(taken.clone());

        // second dispatcher receives them in the original order
        let mut rx2 = subscriber(&store, 2, &[ROAD]);
        for expect in &taken {
            assert_eq!(&rx2.try_recv().unwrap(), expect);
        }
    }

    #[test]
    fn duplicate_declared_roads_subscribe_once() {
        let store = Store::new();
        store.register_camera(ROAD, 100);
        let mut rx = subscriber(&store, 1, &[ROAD, ROAD, ROAD]);

        store.record_plate(&plate("DUP"), ROAD, 0, 0);
        store.record_plate(&plate("DUP"), ROAD, 100, 600);

        assert!(rx.try_recv().is_ok());
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn roads_are_independent() {
        let store = Store::new();
        store.register_camera(1, 60);
        store.register_camera(2, 60);
        let mut rx = subscriber(&store, 1, &[2]);

        store.record_plate(&plate("X"), 1, 0, 0);
        store.record_plate(&plate("X"), 1, 100, 600);

        // the ticket is for road 1; our dispatcher only covers road 2
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }
}
