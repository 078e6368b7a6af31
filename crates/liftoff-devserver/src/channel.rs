//! Latest-value broadcast cell used for session status, build stats, proxy logs and
//! restart alarms.
//!
//! A [`BroadcastCell`] keeps exactly one value (the latest) plus an ordered list of
//! observers:
//!
//! - `get()` returns the latest value.
//! - `subscribe()` delivers the latest value immediately, then every later publish, in
//!   issue order, until the subscription is dropped.
//! - `publish()` replaces the latest value and delivers it synchronously to every current
//!   observer in subscription order, unless another thread is already delivering. It is
//!   safe to call before anyone subscribed.
//! - `close()` makes the cell terminal: publishes are rejected and observers are completed.
//!   Late subscribers get the last value followed by immediate completion.
//!
//! Publishes, replays to new subscribers, and the close are queued in issue order and
//! drained by one thread at a time. A thread that finds another one delivering leaves its
//! entry to that thread and returns, so a slow observer never blocks other publishers.
//! An observer may publish, subscribe, or close from inside its callback: the nested call
//! is queued and delivered after the current value reached every observer, so each
//! observer still sees values in issue order. The state lock is never held while observer
//! code runs. A panicking observer is logged and skipped; the remaining observers still
//! receive the value.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;

type NextFn<T> = Box<dyn Fn(&T) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;

struct Observer<T> {
    id: u64,
    /// Sequence number of the value replayed at subscription
    joined_at: u64,
    next: NextFn<T>,
    complete: Option<CompleteFn>,
}

enum Delivery<T> {
    Next {
        seq: u64,
        value: T,
    },
    /// Latest value for one new observer, followed by completion if the cell was closed
    Replay {
        observer: Arc<Observer<T>>,
        value: T,
        complete: bool,
    },
    Complete,
}

struct CellState<T> {
    latest: T,
    seq: u64,
    observers: Vec<Arc<Observer<T>>>,
    queue: VecDeque<Delivery<T>>,
    next_id: u64,
    closed: bool,
    /// A thread is draining `queue`
    draining: bool,
}

struct Shared<T> {
    name: &'static str,
    state: Mutex<CellState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Shared<T> {
    fn subscribe(this: &Arc<Self>, next: NextFn<T>, complete: Option<CompleteFn>) -> Subscription {
        let (id, closed) = {
            let mut state = this.state.lock();
            let id = state.next_id;
            state.next_id += 1;

            let observer = Arc::new(Observer {
                id,
                joined_at: state.seq,
                next,
                complete,
            });
            let closed = state.closed;
            if !closed {
                state.observers.push(Arc::clone(&observer));
            }
            let value = state.latest.clone();
            state.queue.push_back(Delivery::Replay {
                observer,
                value,
                complete: closed,
            });
            (id, closed)
        };

        this.drain();

        if closed {
            return Subscription { detach: None };
        }

        let weak: Weak<Shared<T>> = Arc::downgrade(this);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.state.lock().observers.retain(|o| o.id != id);
                }
            })),
        }
    }

    /// Deliver queued entries until the queue is empty.
    ///
    /// Returns at once if another frame (on this thread or another) is already draining;
    /// that frame picks up whatever was queued.
    fn drain(&self) {
        {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let (delivery, observers) = {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    None => {
                        state.draining = false;
                        break;
                    }
                    Some(Delivery::Complete) => {
                        (Delivery::Complete, std::mem::take(&mut state.observers))
                    }
                    Some(replay @ Delivery::Replay { .. }) => (replay, Vec::new()),
                    Some(next) => (next, state.observers.clone()),
                }
            };

            match delivery {
                Delivery::Next { seq, value } => {
                    for observer in observers.iter().filter(|o| o.joined_at < seq) {
                        self.deliver_next(observer, &value);
                    }
                }
                Delivery::Replay {
                    observer,
                    value,
                    complete,
                } => {
                    self.deliver_next(&observer, &value);
                    if complete {
                        self.deliver_complete(&observer);
                    }
                }
                Delivery::Complete => {
                    tracing::trace!(
                        channel = self.name,
                        observers = observers.len(),
                        "Channel closed"
                    );
                    for observer in &observers {
                        self.deliver_complete(observer);
                    }
                }
            }
        }
    }

    fn deliver_next(&self, observer: &Observer<T>, value: &T) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (observer.next)(value)));
        if outcome.is_err() {
            tracing::error!(
                channel = self.name,
                observer = observer.id,
                "Observer panicked while handling a value; continuing delivery"
            );
        }
    }

    fn deliver_complete(&self, observer: &Observer<T>) {
        if let Some(complete) = &observer.complete {
            if panic::catch_unwind(AssertUnwindSafe(|| complete())).is_err() {
                tracing::error!(
                    channel = self.name,
                    observer = observer.id,
                    "Observer panicked while completing"
                );
            }
        }
    }
}

/// Writable latest-value broadcast cell.
///
/// Cloning shares the same cell. Hand out [`ChannelReader`]s to code that must only observe.
pub struct BroadcastCell<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BroadcastCell<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> BroadcastCell<T> {
    /// Create a cell holding `initial`. `name` only shows up in logs.
    pub fn new(name: &'static str, initial: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(CellState {
                    latest: initial,
                    seq: 0,
                    observers: Vec::new(),
                    queue: VecDeque::new(),
                    next_id: 0,
                    closed: false,
                    draining: false,
                }),
            }),
        }
    }

    /// Read-only view of this cell.
    pub fn reader(&self) -> ChannelReader<T> {
        ChannelReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Latest value.
    pub fn get(&self) -> T {
        self.shared.state.lock().latest.clone()
    }

    /// Replace the latest value and deliver it to every current observer.
    ///
    /// `get()` sees the new value as soon as this returns. When another thread is
    /// delivering, that thread delivers this value too and this call does not wait.
    ///
    /// Returns `false` (and drops the value) once the cell is closed.
    pub fn publish(&self, value: T) -> bool {
        self.publish_if(|_| true, value)
    }

    /// Publish `value` only if `condition` holds for the latest value.
    ///
    /// The check and the update are atomic with respect to other publishes, which makes
    /// this a compare-and-set for state machines built on the cell.
    pub fn publish_if(&self, condition: impl FnOnce(&T) -> bool, value: T) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                tracing::trace!(channel = self.shared.name, "Publish after close ignored");
                return false;
            }
            if !condition(&state.latest) {
                return false;
            }
            state.seq += 1;
            let seq = state.seq;
            state.latest = value.clone();
            state.queue.push_back(Delivery::Next { seq, value });
        }
        self.shared.drain();
        true
    }

    /// Make the cell terminal and complete every observer. Closing twice is a no-op.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.push_back(Delivery::Complete);
        }
        self.shared.drain();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// See [`ChannelReader::subscribe`].
    pub fn subscribe(&self, on_next: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        Shared::subscribe(&self.shared, Box::new(on_next), None)
    }

    /// See [`ChannelReader::stream`].
    pub fn stream(&self) -> CellStream<T> {
        self.reader().stream()
    }

    /// Number of live observers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().observers.len()
    }
}

impl<T: fmt::Debug> fmt::Debug for BroadcastCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BroadcastCell")
            .field("name", &self.shared.name)
            .field("latest", &state.latest)
            .field("observers", &state.observers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Read-only handle to a [`BroadcastCell`].
pub struct ChannelReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ChannelReader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ChannelReader<T> {
    /// Latest value.
    pub fn get(&self) -> T {
        self.shared.state.lock().latest.clone()
    }

    /// Whether the underlying cell is terminal.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Observe the latest value and every later publish.
    ///
    /// The observer runs synchronously on the publishing thread and must not block.
    pub fn subscribe(&self, on_next: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        Shared::subscribe(&self.shared, Box::new(on_next), None)
    }

    /// Like [`subscribe`](Self::subscribe) with an extra callback for when the cell closes.
    pub fn subscribe_with(
        &self,
        on_next: impl Fn(&T) + Send + Sync + 'static,
        on_complete: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        Shared::subscribe(&self.shared, Box::new(on_next), Some(Box::new(on_complete)))
    }

    /// Async stream of the latest value and later publishes; ends when the cell closes.
    pub fn stream(&self) -> CellStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Arc::new(Mutex::new(Some(tx)));
        let completer = Arc::clone(&sender);

        let subscription = self.subscribe_with(
            move |value: &T| {
                if let Some(tx) = sender.lock().as_ref() {
                    let _ = tx.send(value.clone());
                }
            },
            move || {
                completer.lock().take();
            },
        );

        CellStream {
            rx,
            _subscription: subscription,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ChannelReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ChannelReader")
            .field("name", &self.shared.name)
            .field("latest", &state.latest)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Live observer registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Stop receiving values.
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    /// Whether this subscription still holds a registration.
    ///
    /// `false` after `unsubscribe`, and for subscriptions made on an already closed cell.
    pub fn is_active(&self) -> bool {
        self.detach.is_some()
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Async adapter over a subscription. Yields `None` once the cell is closed and drained.
pub struct CellStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    _subscription: Subscription,
}

impl<T> CellStream<T> {
    /// Next value, or `None` after the cell closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Stream for CellStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static)
    where
        T: Sync,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |value: &T| sink.lock().push(value.clone()))
    }

    #[test]
    fn test_get_returns_latest() {
        let cell = BroadcastCell::new("test", 1);
        assert_eq!(cell.get(), 1);
        cell.publish(2);
        assert_eq!(cell.get(), 2);
        assert_eq!(cell.reader().get(), 2);
    }

    #[test]
    fn test_subscriber_sees_latest_then_later_publishes() {
        let cell = BroadcastCell::new("test", 0);
        cell.publish(1);
        cell.publish(2);

        let (seen, observer) = recorder::<i32>();
        let _sub = cell.subscribe(observer);

        cell.publish(3);
        cell.publish(4);

        assert_eq!(*seen.lock(), vec![2, 3, 4]);
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let cell = BroadcastCell::new("test", "a".to_string());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        let _a = cell.subscribe(move |v: &String| first.lock().push(format!("first:{v}")));
        let second = Arc::clone(&order);
        let _b = cell.subscribe(move |v: &String| second.lock().push(format!("second:{v}")));

        order.lock().clear();
        cell.publish("b".to_string());

        assert_eq!(*order.lock(), vec!["first:b", "second:b"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let cell = BroadcastCell::new("test", 0);
        let (seen, observer) = recorder::<i32>();
        let sub = cell.subscribe(observer);
        assert_eq!(cell.subscriber_count(), 1);

        sub.unsubscribe();
        assert_eq!(cell.subscriber_count(), 0);

        cell.publish(7);
        assert_eq!(*seen.lock(), vec![0]);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let cell = BroadcastCell::new("test", 0);
        {
            let _sub = cell.subscribe(|_: &i32| {});
            assert_eq!(cell.subscriber_count(), 1);
        }
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_if_checks_latest_value() {
        let cell = BroadcastCell::new("test", 1);
        assert!(!cell.publish_if(|v| *v == 0, 5));
        assert_eq!(cell.get(), 1);
        assert!(cell.publish_if(|v| *v == 1, 2));
        assert_eq!(cell.get(), 2);
    }

    #[test]
    fn test_publish_after_close_is_rejected() {
        let cell = BroadcastCell::new("test", 1);
        assert!(cell.publish(2));
        cell.close();
        assert!(cell.is_closed());
        assert!(!cell.publish(3));
        assert_eq!(cell.get(), 2);
    }

    #[test]
    fn test_close_completes_observers_once() {
        let cell = BroadcastCell::new("test", 0);
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completions);

        let sub = cell.reader().subscribe_with(
            |_: &i32| {},
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        cell.close();
        cell.close();

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(cell.subscriber_count(), 0);
        drop(sub);
    }

    #[test]
    fn test_late_subscriber_after_close_gets_last_value_and_completion() {
        let cell = BroadcastCell::new("test", 0);
        cell.publish(9);
        cell.close();

        let completed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completed);
        let (seen, observer) = recorder::<i32>();

        let sub = cell.reader().subscribe_with(observer, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(*seen.lock(), vec![9]);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_panicking_observer_does_not_block_others() {
        let cell = BroadcastCell::new("test", 0);
        let _bad = cell.subscribe(|value: &i32| {
            if *value == 1 {
                panic!("observer failure");
            }
        });
        let (seen, observer) = recorder::<i32>();
        let _good = cell.subscribe(observer);

        assert!(cell.publish(1));
        assert!(cell.publish(2));

        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(cell.get(), 2);
        assert_eq!(cell.subscriber_count(), 2);
    }

    #[test]
    fn test_observer_may_publish_reentrantly() {
        let cell = BroadcastCell::new("test", 0);
        let inner = cell.clone();
        let _sub = cell.subscribe(move |value: &i32| {
            if *value == 1 {
                inner.publish(2);
            }
        });

        cell.publish(1);
        assert_eq!(cell.get(), 2);
    }

    #[test]
    fn test_reentrant_publish_keeps_issue_order_for_later_observers() {
        let cell = BroadcastCell::new("test", 0);
        let inner = cell.clone();
        let _first = cell.subscribe(move |value: &i32| {
            if *value == 1 {
                inner.publish(2);
            }
        });
        let (seen, observer) = recorder::<i32>();
        let _second = cell.subscribe(observer);

        cell.publish(1);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_reentrant_close_completes_after_current_value() {
        let cell = BroadcastCell::new("test", 0);
        let inner = cell.clone();
        let _first = cell.subscribe(move |value: &i32| {
            if *value == 1 {
                inner.close();
            }
        });

        let events = Arc::new(Mutex::new(Vec::new()));
        let on_next = Arc::clone(&events);
        let on_complete = Arc::clone(&events);
        let _second = cell.reader().subscribe_with(
            move |v: &i32| on_next.lock().push(v.to_string()),
            move || on_complete.lock().push("complete".to_string()),
        );

        cell.publish(1);
        assert_eq!(*events.lock(), vec!["0", "1", "complete"]);
        assert!(!cell.publish(2));
    }

    #[test]
    fn test_subscribe_inside_observer_sees_latest_once() {
        let cell = BroadcastCell::new("test", 0);
        let inner = cell.clone();
        let late = Arc::new(Mutex::new(Vec::new()));
        let subs = Arc::new(Mutex::new(Vec::new()));
        let _first = {
            let late = Arc::clone(&late);
            let subs = Arc::clone(&subs);
            cell.subscribe(move |value: &i32| {
                if *value == 1 {
                    let late = Arc::clone(&late);
                    subs.lock()
                        .push(inner.subscribe(move |v: &i32| late.lock().push(*v)));
                }
            })
        };

        cell.publish(1);
        cell.publish(2);
        assert_eq!(*late.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_stream_yields_values_and_ends_on_close() {
        let cell = BroadcastCell::new("test", 0);
        let mut stream = cell.stream();

        cell.publish(1);
        cell.publish(2);
        cell.close();

        assert_eq!(stream.recv().await, Some(0));
        assert_eq!(stream.recv().await, Some(1));
        assert_eq!(stream.recv().await, Some(2));
        assert_eq!(stream.recv().await, None);
    }

    #[test]
    fn test_publish_from_many_threads_keeps_per_subscriber_order() {
        let cell = BroadcastCell::new("test", (0usize, 0usize));
        let (seen, observer) = recorder::<(usize, usize)>();
        let _sub = cell.subscribe(observer);

        let handles: Vec<_> = (0..4)
            .map(|thread| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    for i in 1..=50 {
                        cell.publish((thread, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 201);
        for thread in 0..4 {
            let mine: Vec<usize> = seen
                .iter()
                .filter(|(t, i)| *t == thread && *i > 0)
                .map(|(_, i)| *i)
                .collect();
            assert_eq!(mine, (1..=50).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_slow_observer_does_not_block_other_publishers() {
        let cell = BroadcastCell::new("test", 0);
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = Arc::clone(&seen);
            let entered_tx = Mutex::new(entered_tx);
            let release_rx = Mutex::new(release_rx);
            cell.subscribe(move |value: &i32| {
                if *value == 1 {
                    let _ = entered_tx.lock().send(());
                    let _ = release_rx.lock().recv();
                }
                seen.lock().push(*value);
            })
        };

        let publisher = {
            let cell = cell.clone();
            std::thread::spawn(move || cell.publish(1))
        };
        entered_rx.recv().unwrap();

        // The other thread is stuck delivering 1; this publish is handed over to it
        assert!(cell.publish(2));
        assert_eq!(cell.get(), 2);
        assert_eq!(*seen.lock(), vec![0]);

        release_tx.send(()).unwrap();
        assert!(publisher.join().unwrap());
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }
}
