use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::TransportError;

/// One outbound send accepted while the connection was still being established: the
///  payload plus its submission timestamp and the channel on which the submitter is told
///  how the send ended.
pub struct PendingSendEntry {
    payload: Bytes,
    submitted_at: Instant,
    completion: oneshot::Sender<Result<(), TransportError>>,
}

impl PendingSendEntry {
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Reports the final outcome to the submitter. A submitter that dropped its ticket
    ///  is not an error.
    pub fn complete(self, result: Result<(), TransportError>) {
        let _ = self.completion.send(result);
    }
}

/// The submitter's side of a queued send: awaits the entry's completion status.
pub struct SendTicket {
    receiver: oneshot::Receiver<Result<(), TransportError>>,
}

impl SendTicket {
    /// Resolves once the queued send was flushed (after connect success) or failed
    ///  (connect failure or close). If the transport is torn down without ever
    ///  completing the entry, this reports [TransportError::TransportClosed].
    pub async fn outcome(self) -> Result<(), TransportError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::TransportClosed),
        }
    }
}

/// FIFO queue of sends submitted while `connect pending` is true. Entries are flushed in
///  exactly their submission order once the connection is established, or all failed
///  with one error if it never is. No entry is ever reordered or duplicated.
#[derive(Default)]
pub struct PendingSendQueue {
    entries: VecDeque<PendingSendEntry>,
}

impl PendingSendQueue {
    pub fn new() -> PendingSendQueue {
        PendingSendQueue::default()
    }

    pub fn enqueue(&mut self, payload: Bytes) -> SendTicket {
        let (tx, rx) = oneshot::channel();
        self.entries.push_back(PendingSendEntry {
            payload,
            submitted_at: Instant::now(),
            completion: tx,
        });
        SendTicket { receiver: rx }
    }

    /// Drains the queue in submission order for transmission.
    pub fn flush_all(&mut self) -> Vec<PendingSendEntry> {
        self.entries.drain(..).collect()
    }

    /// Drains the queue, reporting `error` to every submitter without transmitting.
    pub fn fail_all(&mut self, error: &TransportError) {
        for entry in self.entries.drain(..) {
            entry.complete(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::single(vec!["a"])]
    #[case::two(vec!["first", "second"])]
    #[case::many(vec!["a", "b", "c", "d", "e"])]
    fn test_flush_preserves_submission_order(#[case] payloads: Vec<&'static str>) {
        let mut queue = PendingSendQueue::new();
        for p in &payloads {
            let _ = queue.enqueue(Bytes::from_static(p.as_bytes()));
        }
        assert_eq!(queue.len(), payloads.len());

        let flushed = queue.flush_all();
        assert!(queue.is_empty());
        let actual = flushed.iter().map(|e| e.payload().clone()).collect::<Vec<_>>();
        let expected = payloads.iter().map(|p| Bytes::from_static(p.as_bytes())).collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn test_flushed_entry_reports_outcome() {
        let mut queue = PendingSendQueue::new();
        let ticket_ok = queue.enqueue(Bytes::from_static(b"x"));
        let ticket_err = queue.enqueue(Bytes::from_static(b"y"));

        let mut flushed = queue.flush_all();
        let second = flushed.pop().unwrap();
        let first = flushed.pop().unwrap();

        first.complete(Ok(()));
        second.complete(Err(TransportError::Stream("broken pipe".to_string())));

        assert_eq!(ticket_ok.outcome().await, Ok(()));
        assert_eq!(ticket_err.outcome().await, Err(TransportError::Stream("broken pipe".to_string())));
    }

    #[tokio::test]
    async fn test_fail_all_reports_error_to_every_submitter() {
        let mut queue = PendingSendQueue::new();
        let t1 = queue.enqueue(Bytes::from_static(b"a"));
        let t2 = queue.enqueue(Bytes::from_static(b"b"));

        queue.fail_all(&TransportError::Connect("unreachable".to_string()));
        assert!(queue.is_empty());

        assert_eq!(t1.outcome().await, Err(TransportError::Connect("unreachable".to_string())));
        assert_eq!(t2.outcome().await, Err(TransportError::Connect("unreachable".to_string())));
    }

    #[tokio::test]
    async fn test_dropped_queue_reports_closed() {
        let mut queue = PendingSendQueue::new();
        let ticket = queue.enqueue(Bytes::from_static(b"a"));
        drop(queue);

        assert_eq!(ticket.outcome().await, Err(TransportError::TransportClosed));
    }
}
