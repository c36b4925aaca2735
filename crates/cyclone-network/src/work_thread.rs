//! One reactor owned by one OS thread, draining an inbox of cross-thread
//! messages. Grounded on the teacher's `Tile`/`thread_boot` per-thread loop
//! (`flux::tile::attach_tile`), generalized here to drain a `LockFreeQueue`
//! inbox instead of a shared-memory spine.
//!
//! Spec.md §4.6 gives `WorkThread` its own wakeup `Pipe`, distinct from the
//! `Looper`'s internal one (which exists purely so `push_stop_request` can
//! interrupt a blocked poll from another thread). `WorkThread` registers
//! its inbox pipe as an ordinary read-interest channel on the reactor it
//! owns.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use cyclone_communication::{LockFreeQueue, Pipe};
use cyclone_utils::{ThreadPriority, thread_boot};
use tracing::{debug, warn};

use crate::reactor::{Interest, Looper};

/// Default inbox capacity; generous enough that a burst of `NewConnection`
/// messages from a busy master thread never has to spin-retry in practice.
pub const INBOX_CAPACITY: usize = 4096;

/// Where a `WorkThread`'s reactor is pinned and how it's scheduled.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkThreadConfig {
    pub core: Option<usize>,
    pub priority: ThreadPriority,
}

/// A cheap, `Send + Clone` handle to post messages into a running
/// `WorkThread`'s inbox from any other thread.
pub struct WorkThreadHandle<M: Send + 'static> {
    inbox: Arc<LockFreeQueue<M, INBOX_CAPACITY>>,
    wake_pipe: Arc<Pipe>,
    stop: Arc<AtomicBool>,
}

impl<M: Send + 'static> Clone for WorkThreadHandle<M> {
    fn clone(&self) -> Self {
        WorkThreadHandle {
            inbox: Arc::clone(&self.inbox),
            wake_pipe: Arc::clone(&self.wake_pipe),
            stop: Arc::clone(&self.stop),
        }
    }
}

impl<M: Send + 'static> WorkThreadHandle<M> {
    /// Push `msg` into the inbox and wake the owning reactor thread iff the
    /// pipe was previously observed drained. The CAS inside `Pipe::notify`
    /// coalesces a burst of `send` calls between two drains into one
    /// wakeup byte.
    pub fn send(&self, msg: M) -> Result<(), cyclone_communication::QueueError> {
        self.inbox.push(msg)?;
        self.wake_pipe.notify();
        Ok(())
    }

    /// Ask the work thread to stop. The thread drains whatever is left of
    /// its Connections/state and exits its loop on its own schedule;
    /// `join()` the thread handle to wait for that.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake_pipe.notify();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Owns one `Looper` on a dedicated OS thread and dispatches inbox messages
/// through `on_message`.
pub struct WorkThread;

impl WorkThread {
    /// Spawn the thread. `build` runs on the new thread with a live
    /// `&mut Looper` (and the handle, so it can capture it for e.g. a
    /// master thread's listen-socket bookkeeping) before the loop starts,
    /// and returns the `on_message` closure that will be invoked once per
    /// posted message thereafter, in FIFO order per producer.
    ///
    /// `on_message` is built *by* `build`, running already on the target
    /// thread, specifically so it's free to close over thread-local,
    /// non-`Send` state (an `Rc<RefCell<_>>` connection table, for
    /// instance) — only `build` itself has to cross the thread boundary.
    pub fn start<M, F, OnMsg>(
        name: impl Into<String>,
        config: WorkThreadConfig,
        build: F,
    ) -> io::Result<(JoinHandle<()>, WorkThreadHandle<M>)>
    where
        M: Send + 'static,
        F: FnOnce(&mut Looper, &WorkThreadHandle<M>) -> OnMsg + Send + 'static,
        OnMsg: FnMut(&mut Looper, M) + 'static,
    {
        let inbox: Arc<LockFreeQueue<M, INBOX_CAPACITY>> = Arc::new(LockFreeQueue::new());
        let wake_pipe = Arc::new(Pipe::new()?);
        let stop = Arc::new(AtomicBool::new(false));

        let handle = WorkThreadHandle {
            inbox: Arc::clone(&inbox),
            wake_pipe: Arc::clone(&wake_pipe),
            stop: Arc::clone(&stop),
        };
        let handle_for_thread = handle.clone();

        let thread_name = name.into();
        let spawn_name = thread_name.clone();
        let join = std::thread::Builder::new()
            .name(spawn_name)
            .spawn(move || {
                thread_boot(config.core, config.priority);

                let mut looper = match Looper::new() {
                    Ok(l) => l,
                    Err(err) => {
                        warn!(?err, thread = %thread_name, "failed to build reactor");
                        return;
                    }
                };

                let mut on_message = build(&mut looper, &handle_for_thread);
                let wake_pipe_for_drain = Arc::clone(&wake_pipe);
                let inbox_for_drain = Arc::clone(&inbox);
                let stop_for_drain = Arc::clone(&stop);
                let on_read: crate::reactor::Callback = Box::new(move |looper, _id| {
                    if let Err(err) = wake_pipe_for_drain.drain() {
                        warn!(?err, "work thread: error draining inbox wake pipe");
                    }
                    wake_pipe_for_drain.mark_drained();
                    loop {
                        match inbox_for_drain.pop() {
                            Some(msg) => on_message(looper, msg),
                            None => break,
                        }
                    }
                    if stop_for_drain.load(Ordering::Acquire) {
                        looper.request_stop();
                    }
                });

                if let Err(err) =
                    looper.register_event(wake_pipe.read_port(), Interest::READ, Some(on_read), None)
                {
                    warn!(?err, thread = %thread_name, "failed to register inbox wake pipe");
                    return;
                }

                if let Err(err) = looper.run() {
                    warn!(?err, thread = %thread_name, "reactor loop exited with error");
                }
                debug!(thread = %thread_name, "work thread exiting");
            })?;

        Ok((join, handle))
    }
}
