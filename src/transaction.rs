use std::fmt::{Debug, Formatter};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::warn;

/// Correlates a control request with its response. Ids are handed out by the message manager
///  in increasing order and wrap around at `u32::MAX`.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct TransactionId(u32);

impl Debug for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "T#{}", self.0)
    }
}

impl TransactionId {
    pub const fn from_raw(raw: u32) -> TransactionId {
        TransactionId(raw)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn next(&self) -> TransactionId {
        TransactionId(self.0.wrapping_add(1))
    }
}

/// What an outstanding transaction asked for - needed to interpret responses that do not echo
///  the request's content (e.g. an open-logical-port response carries only a status code).
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PendingRequest {
    BindConnection,
    OpenLogicalPort { logical_port: u16 },
    CheckLogicalPorts { logical_ports: Vec<u16> },
    KeepAlive,
    LogicalPortIsClosed { logical_port: u16 },
}

#[derive(Debug)]
struct UnconfirmedEntry {
    handle_id: u64,
    request: PendingRequest,
    sent_at: Instant,
}

/// Requests that were sent and are awaiting a response. A response is accepted only if its
///  transaction id is in here and it arrives on the connection the request was sent on.
///  Accepting it removes the entry.
///
/// Entries are never pruned implicitly: [UnconfirmedTransactions::expire] must be called
///  explicitly with the caller's notion of a timeout.
#[derive(Debug, Default)]
pub struct UnconfirmedTransactions {
    entries: FxHashMap<TransactionId, UnconfirmedEntry>,
}

impl UnconfirmedTransactions {
    pub fn insert(&mut self, transaction_id: TransactionId, handle_id: u64, request: PendingRequest, now: Instant) {
        if let Some(prev) = self.entries.insert(transaction_id, UnconfirmedEntry { handle_id, request, sent_at: now }) {
            // only possible after wraparound with an entry that was never confirmed nor expired
            warn!(?transaction_id, "replacing unconfirmed transaction {:?}", prev.request);
        }
    }

    pub fn remove(&mut self, transaction_id: TransactionId) -> Option<PendingRequest> {
        self.entries.remove(&transaction_id)
            .map(|e| e.request)
    }

    /// Removes and returns the entry only if it was sent on `handle_id` and `matches` accepts
    ///  its request, leaving it in place otherwise.
    pub fn remove_if(&mut self, transaction_id: TransactionId, handle_id: u64, matches: impl FnOnce(&PendingRequest) -> bool) -> Option<PendingRequest> {
        match self.entries.get(&transaction_id) {
            Some(entry) if entry.handle_id == handle_id && matches(&entry.request) => self.remove(transaction_id),
            _ => None,
        }
    }

    /// Is there an open request for `logical_port` on `handle_id` that was not answered yet?
    pub fn has_open_request(&self, handle_id: u64, logical_port: u16) -> bool {
        self.entries.values()
            .any(|e| e.handle_id == handle_id && e.request == PendingRequest::OpenLogicalPort { logical_port })
    }

    /// Drops all entries of a connection that is gone. Their responses can not arrive any more.
    pub fn remove_connection(&mut self, handle_id: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.handle_id != handle_id);
        before - self.entries.len()
    }

    pub fn expire(&mut self, now: Instant, older_than: Duration) -> Vec<(TransactionId, PendingRequest)> {
        let expired_ids = self.entries.iter()
            .filter(|(_, e)| now.saturating_duration_since(e.sent_at) > older_than)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();

        let mut result = expired_ids.into_iter()
            .filter_map(|id| self.remove(id).map(|r| (id, r)))
            .collect::<Vec<_>>();
        result.sort_by_key(|(id, _)| *id);
        result
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 1)]
    #[case::regular(41, 42)]
    #[case::wraparound(u32::MAX, 0)]
    fn test_next(#[case] raw: u32, #[case] expected: u32) {
        assert_eq!(TransactionId::from_raw(raw).next(), TransactionId::from_raw(expected));
    }

    #[test]
    fn test_insert_remove() {
        let now = Instant::now();
        let mut unconfirmed = UnconfirmedTransactions::default();
        unconfirmed.insert(TransactionId::from_raw(1), 10, PendingRequest::BindConnection, now);
        unconfirmed.insert(TransactionId::from_raw(2), 10, PendingRequest::OpenLogicalPort { logical_port: 7 }, now);

        assert_eq!(unconfirmed.remove(TransactionId::from_raw(1)), Some(PendingRequest::BindConnection));
        assert_eq!(unconfirmed.remove(TransactionId::from_raw(1)), None);
        assert_eq!(unconfirmed.len(), 1);
    }

    #[test]
    fn test_remove_if() {
        let mut unconfirmed = UnconfirmedTransactions::default();
        unconfirmed.insert(TransactionId::from_raw(3), 10, PendingRequest::KeepAlive, Instant::now());

        assert_eq!(unconfirmed.remove_if(TransactionId::from_raw(3), 10, |r| r == &PendingRequest::BindConnection), None);
        assert_eq!(unconfirmed.len(), 1);
        assert_eq!(unconfirmed.remove_if(TransactionId::from_raw(3), 10, |r| r == &PendingRequest::KeepAlive), Some(PendingRequest::KeepAlive));
        assert_eq!(unconfirmed.len(), 0);
    }

    #[test]
    fn test_remove_if_other_connection() {
        let mut unconfirmed = UnconfirmedTransactions::default();
        unconfirmed.insert(TransactionId::from_raw(3), 10, PendingRequest::KeepAlive, Instant::now());

        assert_eq!(unconfirmed.remove_if(TransactionId::from_raw(3), 11, |_| true), None);
        assert_eq!(unconfirmed.len(), 1);
        assert_eq!(unconfirmed.remove_if(TransactionId::from_raw(3), 10, |_| true), Some(PendingRequest::KeepAlive));
    }

    #[test]
    fn test_has_open_request() {
        let mut unconfirmed = UnconfirmedTransactions::default();
        unconfirmed.insert(TransactionId::from_raw(1), 10, PendingRequest::OpenLogicalPort { logical_port: 7 }, Instant::now());
        unconfirmed.insert(TransactionId::from_raw(2), 11, PendingRequest::OpenLogicalPort { logical_port: 8 }, Instant::now());
        unconfirmed.insert(TransactionId::from_raw(3), 10, PendingRequest::LogicalPortIsClosed { logical_port: 8 }, Instant::now());

        assert!(unconfirmed.has_open_request(10, 7));
        assert!(!unconfirmed.has_open_request(10, 8));
        assert!(!unconfirmed.has_open_request(11, 7));
        assert!(unconfirmed.has_open_request(11, 8));
    }

    #[test]
    fn test_remove_connection() {
        let mut unconfirmed = UnconfirmedTransactions::default();
        unconfirmed.insert(TransactionId::from_raw(1), 10, PendingRequest::KeepAlive, Instant::now());
        unconfirmed.insert(TransactionId::from_raw(2), 11, PendingRequest::KeepAlive, Instant::now());
        unconfirmed.insert(TransactionId::from_raw(3), 10, PendingRequest::BindConnection, Instant::now());

        assert_eq!(unconfirmed.remove_connection(10), 2);
        assert_eq!(unconfirmed.remove_connection(10), 0);
        assert_eq!(unconfirmed.remove(TransactionId::from_raw(2)), Some(PendingRequest::KeepAlive));
    }

    #[test]
    fn test_expire() {
        let start = Instant::now();
        let mut unconfirmed = UnconfirmedTransactions::default();
        unconfirmed.insert(TransactionId::from_raw(1), 10, PendingRequest::KeepAlive, start);
        unconfirmed.insert(TransactionId::from_raw(2), 11, PendingRequest::BindConnection, start + Duration::from_secs(5));

        assert!(unconfirmed.expire(start + Duration::from_secs(3), Duration::from_secs(3)).is_empty());

        let expired = unconfirmed.expire(start + Duration::from_secs(4), Duration::from_secs(3));
        assert_eq!(expired, vec![(TransactionId::from_raw(1), PendingRequest::KeepAlive)]);
        assert_eq!(unconfirmed.len(), 1);
    }
}
