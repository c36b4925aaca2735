//! Single-threaded event loop: I/O readiness plus timers plus a cross-thread
//! wakeup channel, backed by `mio::Poll`.
//!
//! Per the REDESIGN FLAGS note in spec.md §9 ("expose one trait/interface
//! with three implementations chosen at build time"), the three C++ backends
//! (epoll/kqueue/select) collapse into one here: `mio::Poll` already picks
//! the right backend per platform at build time, so `Looper` only has to
//! implement the channel-pool/timer/dispatch semantics on top of it.

use std::{
    io,
    os::fd::RawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use bitflags::bitflags;
use cyclone_communication::Pipe;
use cyclone_utils::safe_panic;
use mio::{Events, Token, unix::SourceFd};
use tracing::{debug, warn};

bitflags! {
    /// Interest a channel has registered. `Interest::NONE` (the default) is
    /// a channel that exists but won't be polled until armed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READ  = 0b01;
        const WRITE = 0b10;
    }
}

impl Interest {
    fn to_mio(self) -> Option<mio::Interest> {
        match (self.contains(Interest::READ), self.contains(Interest::WRITE)) {
            (true, true) => Some(mio::Interest::READABLE.add(mio::Interest::WRITABLE)),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Dense index into the reactor's channel pool. Stable for the lifetime of
/// one `register_event`/`register_timer` call up to the matching
/// `delete_event`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventId(usize);

impl EventId {
    fn token(self) -> Token {
        Token(self.0)
    }
}

/// Callback invoked on readiness or timer fire. Receives the reactor so it
/// can re-arm/disable/delete channels (including itself) synchronously.
pub type Callback = Box<dyn FnMut(&mut Looper, EventId)>;

enum ChannelKind {
    Io { fd: RawFd, registered: bool },
    /// Fires every `interval`; `next_fire` is tracked in a side min-heap.
    Timer { interval: Duration },
}

struct Channel {
    kind: ChannelKind,
    interest: Interest,
    active: bool,
    on_read: Option<Callback>,
    on_write: Option<Callback>,
}

/// A cheap, `Send` handle used to wake a `Looper` from another thread and
/// request it stop. The reactor thread itself cannot meaningfully hold one
/// of these to block on (a reactor cannot join itself, per spec.md §5).
#[derive(Clone)]
pub struct LooperHandle {
    wake_pipe: Arc<Pipe>,
    stop_requested: Arc<AtomicBool>,
}

impl LooperHandle {
    /// Request the loop stop after it finishes the batch it's currently
    /// dispatching (or immediately if it's blocked waiting).
    pub fn push_stop_request(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.wake_pipe.notify();
    }

    /// Wake the loop without asking it to stop; used to flush a message into
    /// a `WorkThread`'s inbox.
    pub fn wake(&self) {
        self.wake_pipe.notify();
    }
}

/// Single-threaded reactor: one per `WorkThread`/master thread.
pub struct Looper {
    poll: mio::Poll,
    mio_events: Events,
    channels: Vec<Option<Channel>>,
    free_list: Vec<usize>,
    pending_free: Vec<usize>,
    timer_heap: Vec<(Instant, EventId)>,
    wake_pipe: Arc<Pipe>,
    wake_id: EventId,
    stop_requested: Arc<AtomicBool>,
}

impl Looper {
    pub fn new() -> io::Result<Self> {
        let poll = mio::Poll::new()?;
        let wake_pipe = Arc::new(Pipe::new()?);
        let mut looper = Looper {
            poll,
            mio_events: Events::with_capacity(256),
            channels: Vec::new(),
            free_list: Vec::new(),
            pending_free: Vec::new(),
            timer_heap: Vec::new(),
            wake_pipe: Arc::clone(&wake_pipe),
            wake_id: EventId(0),
            stop_requested: Arc::new(AtomicBool::new(false)),
        };
        let fd = wake_pipe.read_port();
        let wake_id =
            looper.register_event(fd, Interest::READ, Some(Box::new(Looper::drain_wake)), None)?;
        looper.wake_id = wake_id;
        Ok(looper)
    }

    fn drain_wake(looper: &mut Looper, _id: EventId) {
        if let Err(err) = looper.wake_pipe.drain() {
            warn!(?err, "reactor: error draining wake pipe");
        }
        looper.wake_pipe.mark_drained();
        // A producer may have called `notify` between our drain and the
        // mark above; re-check is the consumer's job per spec.md §4.6, but
        // the reactor re-polls every iteration regardless so a lost wakeup
        // here just costs one extra (harmless) wait.
    }

    pub fn handle(&self) -> LooperHandle {
        LooperHandle {
            wake_pipe: Arc::clone(&self.wake_pipe),
            stop_requested: Arc::clone(&self.stop_requested),
        }
    }

    fn alloc_slot(&mut self) -> usize {
        if let Some(slot) = self.free_list.pop() {
            slot
        } else {
            self.channels.push(None);
            self.channels.len() - 1
        }
    }

    /// Register interest in `fd`. Pass `Interest::empty()` to create an
    /// inactive channel (e.g. for a connecting client socket before its
    /// first arm).
    pub fn register_event(
        &mut self,
        fd: RawFd,
        interest: Interest,
        on_read: Option<Callback>,
        on_write: Option<Callback>,
    ) -> io::Result<EventId> {
        let slot = self.alloc_slot();
        let id = EventId(slot);
        let active = !interest.is_empty();
        let mut registered = false;
        if let Some(mio_interest) = interest.to_mio() {
            self.poll.registry().register(&mut SourceFd(&fd), id.token(), mio_interest)?;
            registered = true;
        }
        self.channels[slot] =
            Some(Channel { kind: ChannelKind::Io { fd, registered }, interest, active, on_read, on_write });
        Ok(id)
    }

    /// Arm a periodic timer; `callback` is invoked roughly every `interval`
    /// from inside `step`/`run`. Spec.md §4.5's "one-shot timer that
    /// re-arms itself" collapses to always-re-arm since nothing here ever
    /// schedules a single fire-and-forget timer.
    pub fn register_timer(&mut self, interval: Duration, callback: Callback) -> EventId {
        let slot = self.alloc_slot();
        let id = EventId(slot);
        self.channels[slot] = Some(Channel {
            kind: ChannelKind::Timer { interval },
            interest: Interest::empty(),
            active: true,
            on_read: Some(callback),
            on_write: None,
        });
        self.timer_heap.push((Instant::now() + interval, id));
        id
    }

    fn channel_mut(&mut self, id: EventId) -> Option<&mut Channel> {
        self.channels.get_mut(id.0).and_then(|c| c.as_mut())
    }

    fn apply_interest(&mut self, id: EventId) -> io::Result<()> {
        let Some(channel) = self.channel_mut(id) else { return Ok(()) };
        let ChannelKind::Io { fd, registered } = &mut channel.kind else { return Ok(()) };
        let fd = *fd;
        match (channel.interest.to_mio(), *registered) {
            (Some(mio_interest), true) => {
                self.poll.registry().reregister(&mut SourceFd(&fd), id.token(), mio_interest)?;
            }
            (Some(mio_interest), false) => {
                self.poll.registry().register(&mut SourceFd(&fd), id.token(), mio_interest)?;
                if let Some(Channel { kind: ChannelKind::Io { registered, .. }, .. }) =
                    self.channel_mut(id)
                {
                    *registered = true;
                }
            }
            (None, true) => {
                self.poll.registry().deregister(&mut SourceFd(&fd))?;
                if let Some(Channel { kind: ChannelKind::Io { registered, .. }, .. }) =
                    self.channel_mut(id)
                {
                    *registered = false;
                }
            }
            (None, false) => {}
        }
        Ok(())
    }

    pub fn enable_read(&mut self, id: EventId) -> io::Result<()> {
        if let Some(c) = self.channel_mut(id) {
            c.interest |= Interest::READ;
            c.active = true;
        }
        self.apply_interest(id)
    }

    pub fn disable_read(&mut self, id: EventId) -> io::Result<()> {
        if let Some(c) = self.channel_mut(id) {
            c.interest.remove(Interest::READ);
            c.active = !c.interest.is_empty();
        }
        self.apply_interest(id)
    }

    pub fn enable_write(&mut self, id: EventId) -> io::Result<()> {
        if let Some(c) = self.channel_mut(id) {
            c.interest |= Interest::WRITE;
            c.active = true;
        }
        self.apply_interest(id)
    }

    pub fn disable_write(&mut self, id: EventId) -> io::Result<()> {
        if let Some(c) = self.channel_mut(id) {
            c.interest.remove(Interest::WRITE);
            c.active = !c.interest.is_empty();
        }
        self.apply_interest(id)
    }

    /// Clear all interest on `id` without freeing its slot. The only
    /// correct teardown order is `disable_all` then `delete_event`.
    pub fn disable_all(&mut self, id: EventId) -> io::Result<()> {
        if let Some(c) = self.channel_mut(id) {
            c.interest = Interest::empty();
            c.active = false;
        }
        self.apply_interest(id)
    }

    /// Free `id`'s slot. The channel must already be inactive (via
    /// `disable_all`); deleting an enabled channel is a programmer error and
    /// debug-panics per spec.md §4.5/§7.
    ///
    /// The slot is not reused until after the current dispatch batch
    /// completes, so a stale id captured earlier in this batch can never
    /// observe a different channel's data.
    pub fn delete_event(&mut self, id: EventId) {
        match self.channels.get(id.0) {
            Some(Some(channel)) => {
                if channel.active {
                    safe_panic!("delete_event({id:?}) called on an active channel");
                }
            }
            _ => {
                safe_panic!("delete_event({id:?}) called on an unknown channel");
                return;
            }
        }
        self.channels[id.0] = None;
        self.pending_free.push(id.0);
    }

    /// Write a stop request from the reactor's own thread (e.g. a callback
    /// decided to shut the loop down). Cross-thread callers should use
    /// `handle().push_stop_request()` instead.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Run one iteration: block up to `timeout` (capped by the next timer
    /// deadline), dispatch ready reads then writes, fire due timers.
    /// `timeout = None` blocks indefinitely; `Some(Duration::ZERO)` is a
    /// non-blocking poll.
    pub fn step(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let wait = self.clamp_to_next_timer(timeout);
        match self.poll.poll(&mut self.mio_events, wait) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let mut read_ready = Vec::new();
        let mut write_ready = Vec::new();
        for ev in self.mio_events.iter() {
            let id = EventId(ev.token().0);
            if ev.is_readable() {
                read_ready.push(id);
            }
            if ev.is_writable() {
                write_ready.push(id);
            }
        }
        read_ready.sort_by_key(|id| id.0);
        write_ready.sort_by_key(|id| id.0);

        for id in read_ready {
            self.dispatch(id, true);
        }
        for id in write_ready {
            self.dispatch(id, false);
        }

        self.fire_due_timers();

        for slot in self.pending_free.drain(..) {
            self.free_list.push(slot);
        }
        Ok(())
    }

    fn clamp_to_next_timer(&self, timeout: Option<Duration>) -> Option<Duration> {
        let Some(&(next_fire, _)) = self.timer_heap.iter().min_by_key(|(t, _)| *t) else {
            return timeout;
        };
        let until = next_fire.saturating_duration_since(Instant::now());
        Some(match timeout {
            Some(t) => t.min(until),
            None => until,
        })
    }

    fn dispatch(&mut self, id: EventId, is_read: bool) {
        let Some(channel) = self.channel_mut(id) else { return };
        if !channel.active {
            return; // became inactive mid-batch
        }
        let wants = if is_read { channel.interest.contains(Interest::READ) } else { channel.interest.contains(Interest::WRITE) };
        if !wants {
            return;
        }
        let slot = if is_read { &mut channel.on_read } else { &mut channel.on_write };
        let Some(mut callback) = slot.take() else { return };
        callback(self, id);
        // The channel may have been deleted by the callback; only restore
        // the callback if the slot still exists.
        if let Some(channel) = self.channel_mut(id) {
            if is_read {
                channel.on_read = Some(callback);
            } else {
                channel.on_write = Some(callback);
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        self.timer_heap.retain(|&(fire_at, id)| {
            if fire_at <= now {
                due.push(id);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|id| id.0);
        for id in due {
            let Some(channel) = self.channel_mut(id) else { continue };
            if !channel.active {
                continue;
            }
            let ChannelKind::Timer { interval } = channel.kind else { continue };
            let Some(mut callback) = channel.on_read.take() else { continue };
            callback(self, id);
            if let Some(channel) = self.channel_mut(id) {
                channel.on_read = Some(callback);
                if channel.active {
                    self.timer_heap.push((Instant::now() + interval, id));
                }
            }
        }
    }

    /// Run until `push_stop_request`/`request_stop` is observed.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.is_stop_requested() {
            self.step(None)?;
        }
        debug!("reactor loop stopped");
        Ok(())
    }

    pub fn active_channel_count(&self) -> usize {
        self.channels.iter().filter(|c| c.as_ref().is_some_and(|c| c.active)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn timer_fires_repeatedly() {
        let mut looper = Looper::new().unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        looper.register_timer(Duration::from_millis(5), Box::new(move |_, _| {
            let _ = tx.send(());
        }));

        let handle = looper.handle();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            handle.push_stop_request();
        });
        looper.run().unwrap();
        let fires = rx.try_iter().count();
        assert!(fires >= 3, "expected several timer fires, got {fires}");
    }

    #[test]
    fn push_stop_request_from_other_thread_stops_loop() {
        let mut looper = Looper::new().unwrap();
        let handle = looper.handle();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            handle.push_stop_request();
        });
        looper.run().unwrap();
        assert!(looper.is_stop_requested());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn register_and_delete_event_reuses_slot() {
        let mut looper = Looper::new().unwrap();
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        assert!(fd >= 0);
        let id = looper.register_event(fd, Interest::READ, Some(Box::new(|_, _| {})), None).unwrap();
        looper.disable_all(id).unwrap();
        looper.delete_event(id);
        // pending_free only flushes at the end of `step`; force one.
        looper.step(Some(Duration::ZERO)).unwrap();
        let id2 = looper.register_event(fd, Interest::READ, Some(Box::new(|_, _| {})), None).unwrap();
        assert_eq!(id.0, id2.0, "freed slot should be reused");
        looper.disable_all(id2).unwrap();
        looper.delete_event(id2);
        unsafe {
            libc::close(fd);
        }
    }
}
