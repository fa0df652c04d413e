//! Task executor and strand serializer.
//!
//! This crate wraps a tokio runtime handle behind the small surface the
//! endpoint layer needs: `post` (always defer), `dispatch` (run inline when
//! the caller is already on a runtime worker), and `make_strand` for building
//! per-session FIFO serializers on top of a multithreaded runtime.
//!
//! A [`Strand`] guarantees that for any two tasks submitted through it, the
//! tasks execute in submission order and never concurrently. On a
//! single-threaded runtime the strand degenerates to a pass-through, since
//! the runtime already serializes everything.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// A unit of work submitted to an executor or strand.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

tokio::task_local! {
    /// Id of the strand currently executing on this task, if any.
    static CURRENT_STRAND: u64;
}

static NEXT_STRAND_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to the runtime driving asynchronous completions.
///
/// Cloning is cheap; all clones refer to the same runtime.
#[derive(Clone, Debug)]
pub struct Executor {
    handle: Handle,
    multithreaded: bool,
}

impl Executor {
    /// Capture the runtime the caller is currently running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, mirroring
    /// [`Handle::current`].
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Wrap an explicit runtime handle.
    pub fn new(handle: Handle) -> Self {
        let multithreaded = matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread);
        Self {
            handle,
            multithreaded,
        }
    }

    /// Whether completions may run on more than one worker thread.
    pub fn is_multithreaded(&self) -> bool {
        self.multithreaded
    }

    /// Queue a task for execution. Never runs inline.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { task() });
    }

    /// Run a task inline when the calling thread is already a runtime
    /// worker, otherwise queue it like [`Executor::post`].
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if Handle::try_current().is_ok() {
            task();
        } else {
            self.post(task);
        }
    }

    /// Spawn a future onto the runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Build a serializer for this executor.
    ///
    /// Multithreaded runtimes get a queued strand; single-threaded runtimes
    /// get a pass-through, since execution is already sequential.
    pub fn make_strand(&self) -> Strand {
        if self.multithreaded {
            Strand::queued(self)
        } else {
            Strand {
                inner: StrandInner::Passthrough(self.clone()),
            }
        }
    }
}

/// FIFO serializer layered atop a multithreaded [`Executor`].
///
/// All tasks submitted through one strand (and its clones) run mutually
/// exclusively and in submission order. `dispatch` from within a task
/// already running on this strand executes inline; from anywhere else it
/// enqueues.
#[derive(Clone, Debug)]
pub struct Strand {
    inner: StrandInner,
}

#[derive(Clone)]
enum StrandInner {
    /// Single-threaded executors already serialize; no queue needed.
    Passthrough(Executor),
    Queue {
        id: u64,
        queue: mpsc::UnboundedSender<Task>,
    },
}

impl std::fmt::Debug for StrandInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrandInner::Passthrough(_) => f.write_str("Passthrough"),
            StrandInner::Queue { id, .. } => f.debug_struct("Queue").field("id", id).finish(),
        }
    }
}

impl Strand {
    fn queued(executor: &Executor) -> Self {
        let id = NEXT_STRAND_ID.fetch_add(1, Ordering::Relaxed);
        let (queue, mut rx) = mpsc::unbounded_channel::<Task>();

        // Single drainer task gives both mutual exclusion and FIFO order.
        executor.spawn(async move {
            while let Some(task) = rx.recv().await {
                CURRENT_STRAND.sync_scope(id, task);
            }
            trace!(strand = id, "strand drained and closed");
        });

        Self {
            inner: StrandInner::Queue { id, queue },
        }
    }

    /// Queue a task behind everything already submitted. Never runs inline.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.inner {
            StrandInner::Passthrough(executor) => executor.post(task),
            StrandInner::Queue { queue, .. } => {
                let _ = queue.send(Box::new(task));
            }
        }
    }

    /// Run a task inline when the caller is already executing on this
    /// strand, otherwise queue it like [`Strand::post`].
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.inner {
            StrandInner::Passthrough(executor) => executor.dispatch(task),
            StrandInner::Queue { id, queue } => {
                let inline = CURRENT_STRAND
                    .try_with(|current| *current == *id)
                    .unwrap_or(false);
                if inline {
                    task();
                } else {
                    let _ = queue.send(Box::new(task));
                }
            }
        }
    }

    /// Whether the calling code is currently executing on this strand.
    pub fn running_in_this_strand(&self) -> bool {
        match &self.inner {
            StrandInner::Passthrough(_) => Handle::try_current().is_ok(),
            StrandInner::Queue { id, .. } => CURRENT_STRAND
                .try_with(|current| *current == *id)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    async fn drain(strand: &Strand) {
        let (tx, rx) = oneshot::channel();
        strand.post(move || {
            let _ = tx.send(());
        });
        timeout(Duration::from_secs(5), rx)
            .await
            .expect("strand did not drain")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn strand_runs_tasks_in_submission_order() {
        let executor = Executor::current();
        assert!(executor.is_multithreaded());

        let strand = executor.make_strand();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..200 {
            let order = order.clone();
            strand.post(move || order.lock().unwrap().push(i));
        }
        drain(&strand).await;

        let seen = order.lock().unwrap();
        assert_eq!(*seen, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn strand_tasks_never_overlap() {
        let executor = Executor::current();
        let strand = executor.make_strand();

        let inside = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        for _ in 0..100 {
            let inside = inside.clone();
            let overlapped = overlapped.clone();
            strand.post(move || {
                if inside.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_micros(50));
                inside.store(false, Ordering::SeqCst);
            });
        }
        drain(&strand).await;

        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dispatch_runs_inline_on_own_strand() {
        let executor = Executor::current();
        let strand = executor.make_strand();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (tx, rx) = oneshot::channel();
        {
            let strand_clone = strand.clone();
            let order = order.clone();
            strand.post(move || {
                order.lock().unwrap().push(1);
                let inner = order.clone();
                strand_clone.dispatch(move || inner.lock().unwrap().push(2));
                order.lock().unwrap().push(3);
                let _ = tx.send(());
            });
        }
        timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dispatch_from_outside_queues_behind_posted_work() {
        let executor = Executor::current();
        let strand = executor.make_strand();
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let order = order.clone();
            strand.post(move || {
                std::thread::sleep(Duration::from_millis(10));
                order.lock().unwrap().push("posted");
            });
        }
        // Not on the strand here, so this must enqueue, not run inline.
        {
            let order = order.clone();
            strand.dispatch(move || order.lock().unwrap().push("dispatched"));
        }
        drain(&strand).await;

        assert_eq!(*order.lock().unwrap(), vec!["posted", "dispatched"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn executor_dispatch_runs_inline_on_worker() {
        let executor = Executor::current();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        executor.dispatch(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn single_threaded_executor_uses_passthrough_strand() {
        let executor = Executor::current();
        assert!(!executor.is_multithreaded());

        let strand = executor.make_strand();
        assert!(matches!(strand.inner, StrandInner::Passthrough(_)));

        let (tx, rx) = oneshot::channel();
        strand.post(move || {
            let _ = tx.send(());
        });
        timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    }
}
