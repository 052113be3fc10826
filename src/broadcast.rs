//! Listener fan-out with a dedicated dispatch thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use crate::Result;

/// Identifies a registered listener so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Delivers values to registered listeners from a single dispatch thread.
///
/// Listeners are invoked in registration order, and because one thread
/// drains a FIFO queue, every listener observes broadcasts in the order
/// they were sent. [`Broadcaster::broadcast`] itself never blocks on
/// listener callbacks.
pub struct Broadcaster<T> {
    listeners: Arc<Mutex<Vec<(ListenerId, Listener<T>)>>>,
    next_id: AtomicU64,
    // `None` only during drop; taking the sender disconnects the channel,
    // which tells the dispatch thread to drain and exit.
    sender: Option<mpsc::Sender<T>>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl<T: Send + 'static> Broadcaster<T> {
    /// Spawns the dispatch thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn new() -> Result<Broadcaster<T>> {
        let listeners: Arc<Mutex<Vec<(ListenerId, Listener<T>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let (sender, receiver) = mpsc::channel::<T>();

        let join_handle = {
            let listeners = Arc::clone(&listeners);
            std::thread::Builder::new()
                .name("switchgear-broadcast".to_owned())
                .spawn(move || {
                    // Loop ends when the sender is dropped and the queue is
                    // drained.
                    for event in receiver {
                        let snapshot: Vec<Listener<T>> = {
                            let listeners = listeners
                                .lock()
                                .expect("thread holding listener lock should not panic");
                            listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
                        };
                        for listener in snapshot {
                            // A panicking listener must not take down
                            // dispatch for everyone else.
                            let result = std::panic::catch_unwind(
                                std::panic::AssertUnwindSafe(|| listener(&event)),
                            );
                            if result.is_err() {
                                log::error!(target: "switchgear", "broadcast listener panicked");
                            }
                        }
                    }
                })?
        };

        Ok(Broadcaster {
            listeners,
            next_id: AtomicU64::new(0),
            sender: Some(sender),
            join_handle: Some(join_handle),
        })
    }

    pub fn add_listener(&self, listener: Box<dyn Fn(&T) + Send + Sync>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .expect("thread holding listener lock should not panic")
            .push((id, Arc::from(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .expect("thread holding listener lock should not panic")
            .retain(|(listener_id, _)| *listener_id != id);
    }

    pub fn has_listeners(&self) -> bool {
        !self
            .listeners
            .lock()
            .expect("thread holding listener lock should not panic")
            .is_empty()
    }

    /// Enqueue a value for delivery. Returns without waiting for listeners.
    pub fn broadcast(&self, event: T) {
        if let Some(sender) = &self.sender {
            // Error means the dispatch thread is gone; nothing useful to do.
            let _ = sender.send(event);
        }
    }
}

impl<T> Drop for Broadcaster<T> {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.join_handle.take() {
            // Error means the dispatch thread panicked; it already logged.
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delivers_to_listeners_in_registration_order() {
        let broadcaster = Broadcaster::<i32>::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let tx1 = tx.clone();
        broadcaster.add_listener(Box::new(move |event| {
            tx1.send((1, *event)).unwrap();
        }));
        let tx2 = tx;
        broadcaster.add_listener(Box::new(move |event| {
            tx2.send((2, *event)).unwrap();
        }));

        broadcaster.broadcast(7);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), (1, 7));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), (2, 7));
    }

    #[test]
    fn listener_sees_broadcasts_in_order() {
        let broadcaster = Broadcaster::<i32>::new().unwrap();
        let (tx, rx) = mpsc::channel();
        broadcaster.add_listener(Box::new(move |event| {
            tx.send(*event).unwrap();
        }));

        for i in 0..10 {
            broadcaster.broadcast(i);
        }
        let received: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(received, (0..10).collect::<Vec<i32>>());
    }

    #[test]
    fn removed_listener_no_longer_receives() {
        let broadcaster = Broadcaster::<i32>::new().unwrap();
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        let a = broadcaster.add_listener(Box::new(move |event| {
            let _ = tx_a.send(*event);
        }));
        broadcaster.add_listener(Box::new(move |event| {
            let _ = tx_b.send(*event);
        }));

        broadcaster.broadcast(1);
        assert_eq!(rx_a.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(rx_b.recv_timeout(Duration::from_secs(1)).unwrap(), 1);

        broadcaster.remove_listener(a);
        broadcaster.broadcast(2);
        assert_eq!(rx_b.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn has_listeners_tracks_registration() {
        let broadcaster = Broadcaster::<i32>::new().unwrap();
        assert!(!broadcaster.has_listeners());
        let id = broadcaster.add_listener(Box::new(|_| {}));
        assert!(broadcaster.has_listeners());
        broadcaster.remove_listener(id);
        assert!(!broadcaster.has_listeners());
    }

    #[test]
    fn panicking_listener_does_not_stop_dispatch() {
        let broadcaster = Broadcaster::<i32>::new().unwrap();
        broadcaster.add_listener(Box::new(|_| panic!("listener bug")));
        let (tx, rx) = mpsc::channel();
        broadcaster.add_listener(Box::new(move |event| {
            tx.send(*event).unwrap();
        }));

        broadcaster.broadcast(1);
        broadcaster.broadcast(2);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
    }
}
