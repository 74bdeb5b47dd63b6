//! Reliable-delivery channel layered over unreliable datagrams.
//!
//! Every inter-process link in the system reuses these pieces: a send
//! side that retains unacknowledged payloads keyed by sequence number, a
//! receive side that applies payloads strictly in sequence order, a
//! deadline-ordered resend queue, and an RTT estimate that sizes
//! retransmission deadlines. Acks are cumulative: an ack of `v` means
//! every sequence up to and including `v` has been applied by the peer.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::time::{Duration, Instant};

/// Send half of a link. Sequence numbers may be assigned here (`push`)
/// or externally (`register`, used when the section version is the
/// sequence space).
#[derive(Debug, Clone)]
pub struct SendChannel<P> {
    next_seq: u64,
    cumulative_ack: u64,
    unacked: BTreeMap<u64, P>,
}

impl<P: Clone> SendChannel<P> {
    pub fn new() -> Self {
        Self::with_base(0)
    }

    /// Starts the sequence space after `base`; a peer that holds a
    /// snapshot at version `base` expects `base + 1` next.
    pub fn with_base(base: u64) -> Self {
        Self {
            next_seq: base + 1,
            cumulative_ack: base,
            unacked: BTreeMap::new(),
        }
    }

    /// Assigns the next sequence number to `payload` and retains it
    /// until acknowledged.
    pub fn push(&mut self, payload: P) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.unacked.insert(seq, payload);
        seq
    }

    /// Retains a payload under an externally assigned sequence number.
    pub fn register(&mut self, seq: u64, payload: P) {
        self.unacked.insert(seq, payload);
        if seq >= self.next_seq {
            self.next_seq = seq + 1;
        }
    }

    /// Processes a cumulative ack: retires every entry with sequence
    /// `<= ack` and returns the entry `ack + 1` for fast retransmission
    /// when the peer is evidently missing it.
    pub fn on_ack(&mut self, ack: u64) -> Option<(u64, P)> {
        if ack > self.cumulative_ack {
            self.cumulative_ack = ack;
        }
        let retained = self.unacked.split_off(&(ack + 1));
        self.unacked = retained;
        self.unacked
            .get(&(ack + 1))
            .map(|p| (ack + 1, p.clone()))
    }

    /// Payload still awaiting acknowledgement, if any.
    pub fn payload(&self, seq: u64) -> Option<&P> {
        self.unacked.get(&seq)
    }

    pub fn cumulative_ack(&self) -> u64 {
        self.cumulative_ack
    }

    pub fn in_flight(&self) -> usize {
        self.unacked.len()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

impl<P: Clone> Default for SendChannel<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive half of a link: holds out-of-order payloads and releases
/// them strictly in sequence order. Duplicates are dropped silently.
#[derive(Debug, Clone)]
pub struct RecvChannel<P> {
    last_applied: u64,
    pending: BTreeMap<u64, P>,
}

impl<P> RecvChannel<P> {
    pub fn new() -> Self {
        Self::with_base(0)
    }

    pub fn with_base(base: u64) -> Self {
        Self {
            last_applied: base,
            pending: BTreeMap::new(),
        }
    }

    /// Offers a received payload. Returns the contiguous run that became
    /// applicable, in order; empty when the payload was buffered for
    /// later or was a duplicate.
    pub fn accept(&mut self, seq: u64, payload: P) -> Vec<(u64, P)> {
        if seq <= self.last_applied || self.pending.contains_key(&seq) {
            return Vec::new();
        }
        self.pending.insert(seq, payload);

        let mut ready = Vec::new();
        while let Some(payload) = self.pending.remove(&(self.last_applied + 1)) {
            self.last_applied += 1;
            ready.push((self.last_applied, payload));
        }
        ready
    }

    /// The value carried in outgoing acks: highest sequence applied with
    /// no gaps below it.
    pub fn cumulative_ack(&self) -> u64 {
        self.last_applied
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

impl<P> Default for RecvChannel<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Deadline-ordered retransmission queue. The owning event loop sleeps
/// until `next_deadline` and drains due entries with `pop_due`; entries
/// whose payload is still unacknowledged are re-armed by the caller.
#[derive(Debug)]
pub struct ResendQueue<K: Ord> {
    heap: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K: Ord> ResendQueue<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, deadline: Instant, key: K) {
        self.heap.push(Reverse((deadline, key)));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Removes and returns one entry whose deadline has passed.
    pub fn pop_due(&mut self, now: Instant) -> Option<K> {
        match self.heap.peek() {
            Some(Reverse((at, _))) if *at <= now => {
                self.heap.pop().map(|Reverse((_, key))| key)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<K: Ord> Default for ResendQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Round-trip estimate for one peer, overwritten opportunistically from
/// keepalive echo timestamps. Retransmission deadlines are twice the
/// current estimate; there is no exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimate {
    rtt: Duration,
}

/// Lower bound on the estimate; clock skew between peers can otherwise
/// produce a zero or negative sample.
const MIN_RTT: Duration = Duration::from_millis(50);

impl RttEstimate {
    pub fn new(initial: Duration) -> Self {
        Self {
            rtt: initial.max(MIN_RTT),
        }
    }

    pub fn update(&mut self, sample: Duration) {
        self.rtt = sample.max(MIN_RTT);
    }

    pub fn current(&self) -> Duration {
        self.rtt
    }

    pub fn as_millis(&self) -> u64 {
        self.rtt.as_millis() as u64
    }

    pub fn resend_delay(&self) -> Duration {
        self.rtt * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_assigns_increasing_sequences() {
        let mut tx = SendChannel::new();
        assert_eq!(tx.push(b"a".to_vec()), 1);
        assert_eq!(tx.push(b"b".to_vec()), 2);
        assert_eq!(tx.push(b"c".to_vec()), 3);
        assert_eq!(tx.in_flight(), 3);
    }

    #[test]
    fn test_cumulative_ack_retires_prefix() {
        let mut tx = SendChannel::new();
        for p in [b"a", b"b", b"c", b"d"] {
            tx.push(p.to_vec());
        }
        tx.on_ack(3);
        assert_eq!(tx.in_flight(), 1);
        assert!(tx.payload(4).is_some());
        assert!(tx.payload(3).is_none());
        assert_eq!(tx.cumulative_ack(), 3);
    }

    #[test]
    fn test_fast_retransmit_on_gap() {
        // Peer applied through 3 while 4 and 5 are in flight: an ack of 3
        // indicates 4 is missing and hands it back for retransmission.
        let mut tx = SendChannel::new();
        for p in [b"a", b"b", b"c", b"d", b"e"] {
            tx.push(p.to_vec());
        }
        let resend = tx.on_ack(3);
        assert_eq!(resend, Some((4, b"d".to_vec())));
    }

    #[test]
    fn test_ack_of_latest_triggers_no_retransmit() {
        let mut tx = SendChannel::new();
        tx.push(b"a".to_vec());
        tx.push(b"b".to_vec());
        assert_eq!(tx.on_ack(2), None);
        assert_eq!(tx.in_flight(), 0);
    }

    #[test]
    fn test_stale_ack_is_harmless() {
        let mut tx = SendChannel::new();
        tx.push(b"a".to_vec());
        tx.push(b"b".to_vec());
        tx.on_ack(2);
        assert_eq!(tx.on_ack(1), None);
        assert_eq!(tx.cumulative_ack(), 2);
    }

    #[test]
    fn test_register_with_external_sequence_space() {
        // A section snapshot at version 7 starts the feed at 8.
        let mut tx = SendChannel::with_base(7);
        tx.register(8, b"v8".to_vec());
        tx.register(9, b"v9".to_vec());
        assert_eq!(tx.next_seq(), 10);
        let resend = tx.on_ack(7);
        assert_eq!(resend, Some((8, b"v8".to_vec())));
    }

    #[test]
    fn test_receive_in_order() {
        let mut rx = RecvChannel::new();
        assert_eq!(rx.accept(1, "a"), vec![(1, "a")]);
        assert_eq!(rx.accept(2, "b"), vec![(2, "b")]);
        assert_eq!(rx.cumulative_ack(), 2);
    }

    #[test]
    fn test_receive_out_of_order_releases_contiguous_run() {
        let mut rx = RecvChannel::new();
        assert!(rx.accept(2, "b").is_empty());
        assert!(rx.accept(3, "c").is_empty());
        assert_eq!(rx.cumulative_ack(), 0);
        assert_eq!(rx.buffered(), 2);

        let ready = rx.accept(1, "a");
        assert_eq!(ready, vec![(1, "a"), (2, "b"), (3, "c")]);
        assert_eq!(rx.cumulative_ack(), 3);
        assert_eq!(rx.buffered(), 0);
    }

    #[test]
    fn test_duplicate_delivery_is_noop() {
        let mut rx = RecvChannel::new();
        assert_eq!(rx.accept(1, "a").len(), 1);
        assert!(rx.accept(1, "a").is_empty());
        assert!(rx.accept(3, "c").is_empty());
        assert!(rx.accept(3, "c").is_empty());
        assert_eq!(rx.buffered(), 1);
    }

    #[test]
    fn test_receive_from_snapshot_base() {
        let mut rx = RecvChannel::with_base(5);
        assert!(rx.accept(5, "stale").is_empty());
        assert_eq!(rx.accept(6, "fresh"), vec![(6, "fresh")]);
    }

    #[test]
    fn test_ordering_under_arbitrary_arrival() {
        let mut rx = RecvChannel::new();
        let arrival = [4u64, 1, 5, 3, 1, 2, 5];
        let mut applied = Vec::new();
        for seq in arrival {
            for (s, _) in rx.accept(seq, ()) {
                applied.push(s);
            }
        }
        assert_eq!(applied, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_resend_queue_orders_by_deadline() {
        let mut q = ResendQueue::new();
        let now = Instant::now();
        q.push(now + Duration::from_millis(30), 3u32);
        q.push(now + Duration::from_millis(10), 1u32);
        q.push(now + Duration::from_millis(20), 2u32);

        assert_eq!(q.next_deadline(), Some(now + Duration::from_millis(10)));
        let later = now + Duration::from_millis(25);
        assert_eq!(q.pop_due(later), Some(1));
        assert_eq!(q.pop_due(later), Some(2));
        assert_eq!(q.pop_due(later), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_rtt_estimate_floors_and_sizes_resend() {
        let mut rtt = RttEstimate::new(Duration::from_secs(1));
        assert_eq!(rtt.resend_delay(), Duration::from_secs(2));
        rtt.update(Duration::from_millis(120));
        assert_eq!(rtt.resend_delay(), Duration::from_millis(240));
        rtt.update(Duration::ZERO);
        assert_eq!(rtt.current(), Duration::from_millis(50));
    }
}
