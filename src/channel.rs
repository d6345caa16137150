//! Bounded, closable, cancellation-aware channels.
//!
//! [`bounded`] creates a multi-producer, multi-consumer FIFO queue. A capacity
//! of zero gives a synchronous hand-off: `send` returns only once a receiver
//! has taken the value.
//!
//! Every blocking operation takes a [`CancelToken`] and unblocks with a
//! cancellation report as soon as the token fires.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_stream::Stream;

use crate::cancel::{CancelCause, CancelToken};
use crate::error::{Error, Result};

/// Create a channel holding up to `capacity` values. Zero means rendezvous.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            next_seq: 0,
            taken_through: 0,
            closed: false,
            close_called: false,
            senders: 1,
            receivers: 1,
            waiting_receivers: 0,
        }),
        capacity,
        recv_ready: Notify::new(),
        send_ready: Notify::new(),
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    /// Signalled when a value is enqueued or the channel closes
    recv_ready: Notify,
    /// Signalled when a slot frees, a value is taken, or the last receiver leaves
    send_ready: Notify,
}

struct State<T> {
    queue: VecDeque<(u64, T)>,
    next_seq: u64,
    /// One past the sequence number of the last value a receiver took
    taken_through: u64,
    closed: bool,
    close_called: bool,
    senders: usize,
    receivers: usize,
    waiting_receivers: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Rendezvous channels still park one offered value in the queue.
    fn slot_limit(&self) -> usize {
        self.capacity.max(1)
    }
}

/// Why a blocking send did not complete. The unsent value is handed back.
pub enum SendError<T> {
    /// The channel was closed
    Closed(T),
    /// Every receiver was dropped
    Disconnected(T),
    /// The token fired before the value was accepted
    Cancelled(T, CancelCause),
}

impl<T> SendError<T> {
    /// Recover the value that was not delivered.
    pub fn into_inner(self) -> T {
        match self {
            SendError::Closed(v) | SendError::Disconnected(v) | SendError::Cancelled(v, _) => v,
        }
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed(_) => write!(f, "Closed(..)"),
            SendError::Disconnected(_) => write!(f, "Disconnected(..)"),
            SendError::Cancelled(_, cause) => write!(f, "Cancelled(.., {:?})", cause),
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed(_) => write!(f, "send on a closed channel"),
            SendError::Disconnected(_) => write!(f, "all receivers were dropped"),
            SendError::Cancelled(_, cause) => write!(f, "send cancelled: {}", cause),
        }
    }
}

impl<T> std::error::Error for SendError<T> {}

impl<T> From<SendError<T>> for Error {
    fn from(err: SendError<T>) -> Self {
        match err {
            SendError::Closed(_) | SendError::Disconnected(_) => Error::ChannelClosed,
            SendError::Cancelled(_, cause) => Error::Cancelled(cause),
        }
    }
}

/// Why a non-blocking send did not complete.
pub enum TrySendError<T> {
    /// No room; the send would block
    Full(T),
    Closed(T),
    Disconnected(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) | TrySendError::Disconnected(v) => v,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, TrySendError::Full(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "Full(..)"),
            TrySendError::Closed(_) => write!(f, "Closed(..)"),
            TrySendError::Disconnected(_) => write!(f, "Disconnected(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel is full"),
            TrySendError::Closed(_) => write!(f, "send on a closed channel"),
            TrySendError::Disconnected(_) => write!(f, "all receivers were dropped"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

/// Why a non-blocking receive returned nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    /// Nothing queued yet; the receive would block
    #[error("channel is empty")]
    Empty,
    /// Closed and fully drained
    #[error("channel is closed and drained")]
    Closed,
}

/// The write half of a channel.
///
/// Clones share the channel. The channel closes when [`Sender::close`] is
/// called or when the last sender is dropped.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Send a value, waiting for room (or, at capacity zero, for a receiver
    /// to take it).
    pub async fn send(&self, value: T, token: &CancelToken) -> std::result::Result<(), SendError<T>> {
        let mut value = value;
        let seq = loop {
            if token.is_cancelled() {
                return Err(SendError::Cancelled(value, cause_of(token)));
            }

            let notified = self.shared.send_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_enqueue(value) {
                Ok(seq) => break seq,
                Err(TrySendError::Full(v)) => value = v,
                Err(TrySendError::Closed(v)) => return Err(SendError::Closed(v)),
                Err(TrySendError::Disconnected(v)) => return Err(SendError::Disconnected(v)),
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = &mut notified => {}
            }
        };

        if self.shared.capacity == 0 {
            self.await_handoff(seq, token).await
        } else {
            Ok(())
        }
    }

    /// Send without waiting. At capacity zero this only succeeds when a
    /// receiver is already parked waiting for a value.
    pub fn try_send(&self, value: T) -> std::result::Result<(), TrySendError<T>> {
        if self.shared.capacity == 0 {
            let state = self.shared.lock();
            if state.waiting_receivers <= state.queue.len() && !state.closed && state.receivers > 0 {
                return Err(TrySendError::Full(value));
            }
        }
        self.try_enqueue(value).map(|_| ())
    }

    fn try_enqueue(&self, value: T) -> std::result::Result<u64, TrySendError<T>> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(TrySendError::Closed(value));
        }
        if state.receivers == 0 {
            return Err(TrySendError::Disconnected(value));
        }
        if state.queue.len() >= self.shared.slot_limit() {
            return Err(TrySendError::Full(value));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push_back((seq, value));
        drop(state);
        self.shared.recv_ready.notify_waiters();
        Ok(seq)
    }

    async fn await_handoff(&self, seq: u64, token: &CancelToken) -> std::result::Result<(), SendError<T>> {
        loop {
            let notified = self.shared.send_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.taken_through > seq {
                    return Ok(());
                }
                let withdraw = if token.is_cancelled() {
                    Some(true)
                } else if state.receivers == 0 {
                    Some(false)
                } else {
                    None
                };
                if let Some(cancelled) = withdraw {
                    let position = state.queue.iter().position(|(s, _)| *s == seq);
                    // Not in the queue any more means a receiver already took it.
                    let Some((_, value)) = position.and_then(|p| state.queue.remove(p)) else {
                        return Ok(());
                    };
                    drop(state);
                    self.shared.send_ready.notify_waiters();
                    return Err(if cancelled {
                        SendError::Cancelled(value, cause_of(token))
                    } else {
                        SendError::Disconnected(value)
                    });
                }
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = &mut notified => {}
            }
        }
    }

    /// Close the channel. Values already queued are still delivered.
    ///
    /// Closing twice is a usage error and returns [`Error::ChannelClosed`].
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.close_called {
            return Err(Error::ChannelClosed);
        }
        state.close_called = true;
        state.closed = true;
        drop(state);
        self.shared.recv_ready.notify_waiters();
        self.shared.send_ready.notify_waiters();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// True once every receiver has been dropped.
    pub fn is_disconnected(&self) -> bool {
        self.shared.lock().receivers == 0
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.senders -= 1;
        if state.senders == 0 && !state.closed {
            state.closed = true;
            drop(state);
            self.shared.recv_ready.notify_waiters();
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.shared.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The read half of a channel.
///
/// Clones share the queue; each value is delivered to exactly one receiver.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Receive the next value.
    ///
    /// `Ok(None)` means the channel is closed and drained. If `token` fires
    /// while waiting, returns [`Error::Cancelled`] and nothing is consumed.
    pub async fn recv(&self, token: &CancelToken) -> Result<Option<T>> {
        loop {
            if token.is_cancelled() {
                return Err(token.cancelled_error());
            }

            let notified = self.shared.recv_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if let Some((seq, value)) = state.queue.pop_front() {
                    state.taken_through = seq + 1;
                    drop(state);
                    self.shared.send_ready.notify_waiters();
                    return Ok(Some(value));
                }
                if state.closed {
                    return Ok(None);
                }
                state.waiting_receivers += 1;
            }

            let _parked = Parked(&self.shared);
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = &mut notified => {}
            }
        }
    }

    /// Receive without waiting.
    pub fn try_recv(&self) -> std::result::Result<T, TryRecvError> {
        let mut state = self.shared.lock();
        match state.queue.pop_front() {
            Some((seq, value)) => {
                state.taken_through = seq + 1;
                drop(state);
                self.shared.send_ready.notify_waiters();
                Ok(value)
            }
            None if state.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Adapt this receiver into a stream that ends when the channel is closed
    /// and drained, or when `token` fires.
    pub fn into_stream(self, token: CancelToken) -> impl Stream<Item = T> + Send + 'static
    where
        T: Send + 'static,
    {
        futures::stream::unfold((self, token), |(rx, token)| async move {
            match rx.recv(&token).await {
                Ok(Some(value)) => Some((value, (rx, token))),
                _ => None,
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.shared.lock().receivers += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.receivers -= 1;
        if state.receivers == 0 {
            drop(state);
            self.shared.send_ready.notify_waiters();
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.shared.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// Counts a receiver parked in `recv` so rendezvous `try_send` can see it.
struct Parked<'a, T>(&'a Shared<T>);

impl<T> Drop for Parked<'_, T> {
    fn drop(&mut self) {
        self.0.lock().waiting_receivers -= 1;
    }
}

fn cause_of(token: &CancelToken) -> CancelCause {
    token.cause().unwrap_or(CancelCause::Requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test]
    async fn test_fifo_single_producer_various_capacities() {
        for capacity in [0usize, 1, 3, 64] {
            let token = CancelToken::new();
            let (tx, rx) = bounded(capacity);
            let producer_token = token.clone();
            let producer = tokio::spawn(async move {
                for i in 0..50 {
                    tx.send(i, &producer_token).await.unwrap();
                }
                tx.close().unwrap();
            });

            let mut received = Vec::new();
            while let Some(v) = rx.recv(&token).await.unwrap() {
                received.push(v);
            }
            producer.await.unwrap();
            assert_eq!(received, (0..50).collect::<Vec<_>>(), "capacity {}", capacity);
        }
    }

    #[tokio::test]
    async fn test_values_queued_before_close_are_delivered() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(4);
        tx.send(1, &token).await.unwrap();
        tx.send(2, &token).await.unwrap();
        tx.close().unwrap();

        assert!(matches!(tx.send(3, &token).await, Err(SendError::Closed(3))));
        assert_eq!(rx.recv(&token).await.unwrap(), Some(1));
        assert_eq!(rx.recv(&token).await.unwrap(), Some(2));
        assert_eq!(rx.recv(&token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_double_close_is_an_error() {
        let (tx, _rx) = bounded::<u8>(1);
        tx.close().unwrap();
        assert!(matches!(tx.close(), Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_dropping_last_sender_closes() {
        let token = CancelToken::new();
        let (tx, rx) = bounded::<u8>(1);
        let tx2 = tx.clone();
        drop(tx);
        assert!(!rx.is_closed());
        drop(tx2);
        assert_eq!(rx.recv(&token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_try_variants_report_would_block() {
        let (tx, rx) = bounded(1);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        tx.try_send(1).unwrap();
        assert!(tx.try_send(2).unwrap_err().is_full());
        assert_eq!(rx.try_recv(), Ok(1));
        tx.close().unwrap();
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[tokio::test]
    async fn test_rendezvous_try_send_needs_parked_receiver() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(0);
        assert!(tx.try_send(1).unwrap_err().is_full());

        let mut recv = tokio_test::task::spawn(rx.recv(&token));
        assert_pending!(recv.poll());

        tx.try_send(7).unwrap();
        assert!(recv.is_woken());
        assert_eq!(assert_ready!(recv.poll()).unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_blocked_recv_wakes_on_send() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(2);

        let mut recv = tokio_test::task::spawn(rx.recv(&token));
        assert_pending!(recv.poll());

        tx.try_send("hello").unwrap();
        assert!(recv.is_woken());
        assert_eq!(assert_ready!(recv.poll()).unwrap(), Some("hello"));
    }

    #[tokio::test]
    async fn test_full_send_unblocks_on_cancel() {
        let token = CancelToken::new();
        let (tx, _rx) = bounded(1);
        tx.send(1, &token).await.unwrap();

        let send_token = token.derive();
        let canceller = send_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        match tx.send(2, &send_token).await {
            Err(SendError::Cancelled(v, _)) => assert_eq!(v, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tx.len(), 1);
    }

    #[tokio::test]
    async fn test_rendezvous_send_withdraws_on_cancel() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(0);

        let send_token = token.derive();
        let canceller = send_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        assert!(matches!(
            tx.send(5, &send_token).await,
            Err(SendError::Cancelled(5, _))
        ));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_recv_unblocks_on_cancel() {
        let token = CancelToken::new();
        let (_tx, rx) = bounded::<u8>(1);
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel_with(CancelCause::reason("enough"));
        });
        let err = rx.recv(&token).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_send_fails_when_receivers_gone() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(1);
        drop(rx);
        assert!(tx.is_disconnected());
        assert!(matches!(tx.send(1, &token).await, Err(SendError::Disconnected(1))));
    }

    #[tokio::test]
    async fn test_multiple_producers_preserve_own_order() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(2);
        let mut handles = Vec::new();
        for producer in 0..3u32 {
            let tx = tx.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..20u32 {
                    tx.send((producer, i), &token).await.unwrap();
                }
            }));
        }
        drop(tx);

        let mut last = [None::<u32>; 3];
        let mut count = 0;
        while let Some((producer, i)) = rx.recv(&token).await.unwrap() {
            let slot = &mut last[producer as usize];
            assert!(slot.map_or(true, |prev| prev < i));
            *slot = Some(i);
            count += 1;
        }
        assert_eq!(count, 60);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_into_stream() {
        use tokio_stream::StreamExt;

        let token = CancelToken::new();
        let (tx, rx) = bounded(8);
        for i in 0..5 {
            tx.try_send(i).unwrap();
        }
        drop(tx);
        let collected: Vec<_> = rx.into_stream(token).collect().await;
        assert_eq!(collected, vec![0, 1, 2, 3, 4]);
    }
}
