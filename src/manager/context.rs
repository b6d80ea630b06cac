//! Single-threaded cooperative execution contexts.
//!
//! A context owns its state on a dedicated thread and runs submitted tasks
//! strictly sequentially. Delayed tasks are held in a timer heap and fire in
//! deadline order. Tasks must not block; work that needs another context
//! hops explicitly through that context's handle.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S> {
    Run(Job<S>),
    RunAfter(Duration, Job<S>),
    Shutdown,
}

/// Cheap cloneable submission handle for a context.
pub struct ContextHandle<S> {
    tx: Sender<Message<S>>,
}

impl<S> Clone for ContextHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: 'static> ContextHandle<S> {
    /// Creates the handle/receiver pair before the thread exists, so two
    /// contexts can hold each other's handles.
    pub fn channel() -> (Self, TaskReceiver<S>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, TaskReceiver { rx })
    }

    /// Submits a task. Returns false if the context has shut down.
    pub fn execute(&self, f: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.tx.send(Message::Run(Box::new(f))).is_ok()
    }

    /// Submits a task to run after the given delay.
    pub fn schedule(&self, delay: Duration, f: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.tx
            .send(Message::RunAfter(delay, Box::new(f)))
            .is_ok()
    }
}

/// Receiving half handed to [`ThreadContext::start`].
pub struct TaskReceiver<S> {
    rx: Receiver<Message<S>>,
}

/// A running context thread.
pub struct ThreadContext<S> {
    handle: ContextHandle<S>,
    join: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> ThreadContext<S> {
    pub fn start(handle: ContextHandle<S>, receiver: TaskReceiver<S>, state: S) -> Self {
        let join = thread::spawn(move || run_loop(receiver.rx, state));
        Self {
            handle,
            join: Some(join),
        }
    }

    pub fn handle(&self) -> ContextHandle<S> {
        self.handle.clone()
    }

    pub fn execute(&self, f: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.handle.execute(f)
    }

    pub fn schedule(&self, delay: Duration, f: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.handle.schedule(delay, f)
    }

    /// Stops the context after draining already-submitted tasks, and joins
    /// the thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.handle.tx.send(Message::Shutdown);
            let _ = join.join();
        }
    }
}

impl<S> Drop for ThreadContext<S> {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.handle.tx.send(Message::Shutdown);
            let _ = join.join();
        }
    }
}

struct Timer<S> {
    at: Instant,
    seq: u64,
    job: Job<S>,
}

impl<S> PartialEq for Timer<S> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<S> Eq for Timer<S> {}

impl<S> PartialOrd for Timer<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Timer<S> {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

const IDLE_WAIT: Duration = Duration::from_millis(500);

fn run_loop<S>(rx: Receiver<Message<S>>, mut state: S) {
    let mut timers: BinaryHeap<Timer<S>> = BinaryHeap::new();
    let mut next_seq = 0u64;
    loop {
        let now = Instant::now();
        while let Some(timer) = timers.peek() {
            if timer.at > now {
                break;
            }
            let timer = timers.pop().expect("peeked timer");
            (timer.job)(&mut state);
        }

        let wait = timers
            .peek()
            .map(|timer| timer.at.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAIT);

        match rx.recv_timeout(wait) {
            Ok(Message::Run(job)) => job(&mut state),
            Ok(Message::RunAfter(delay, job)) => {
                timers.push(Timer {
                    at: Instant::now() + delay,
                    seq: next_seq,
                    job,
                });
                next_seq += 1;
            }
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}
