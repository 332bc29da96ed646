//! The single-threaded cooperative event loop.
//!
//! Collaborator replies and deferred work enter the loop as boxed events on
//! an injection channel; the channel is the reactor's I/O multiplexer. The
//! loop alternates between waiting on the channel (bounded by the next timer
//! deadline) and firing due timers, until no event sources and no timers
//! remain, or an exit sentinel is seen.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use rpki::repository::x509::Time;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{
    unbounded_channel, UnboundedReceiver, UnboundedSender,
};

use crate::commons::error::Error;
use crate::commons::CoralResult;

use super::timer::TimerQueue;

//------------ Event ---------------------------------------------------------

/// A unit of work injected into the reactor.
pub type Event<C> = Box<dyn FnOnce(&mut C, &mut Reactor<C>) + Send>;

//------------ FatalError ----------------------------------------------------

/// The sole unrecoverable reactor condition: continuing would risk an
/// unbounded spin, so the process is expected to exit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FatalError {
    /// The event channel reported closed while event sources remained
    /// registered.
    MultiplexerClosed,

    /// The embedded async runtime could not be created.
    Runtime(String),
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FatalError::MultiplexerClosed => write!(
                f,
                "event channel closed with sources registered, not safe \
                 to continue"
            ),
            FatalError::Runtime(e) => {
                write!(f, "cannot create async runtime: {e}")
            }
        }
    }
}

impl std::error::Error for FatalError {}

//------------ ReactorHandle -------------------------------------------------

/// A clonable injector of events into a running reactor.
///
/// Every live handle counts as a registered event source: the loop keeps
/// waiting for input while any exist.
pub struct ReactorHandle<C> {
    tx: UnboundedSender<Event<C>>,
    token: Arc<()>,
}

impl<C> Clone for ReactorHandle<C> {
    fn clone(&self) -> Self {
        ReactorHandle {
            tx: self.tx.clone(),
            token: self.token.clone(),
        }
    }
}

impl<C: 'static> ReactorHandle<C> {
    /// Sends an event into the loop. Returns false if the reactor is gone.
    pub fn send(&self, event: Event<C>) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Asks the loop to exit in an orderly fashion.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Box::new(|_ctx, reactor: &mut Reactor<C>| {
            reactor.exit();
        }));
    }
}

//------------ Reply ---------------------------------------------------------

/// The callback/errback pair handed to a collaborator for one operation.
///
/// Delivering the outcome re-enters the event loop; the consumer closure
/// given at construction runs there. Dropping a reply undelivered simply
/// unregisters the event source.
pub struct Reply<C, T> {
    tx: UnboundedSender<Event<C>>,
    token: Arc<()>,
    consumer:
        Box<dyn FnOnce(&mut C, &mut Reactor<C>, Result<T, Error>) + Send>,
}

impl<C: 'static, T: Send + 'static> Reply<C, T> {
    /// The operation succeeded.
    pub fn ok(self, value: T) {
        self.deliver(Ok(value))
    }

    /// The operation failed.
    pub fn err(self, error: Error) {
        self.deliver(Err(error))
    }

    fn deliver(self, res: Result<T, Error>) {
        let Reply {
            tx,
            token,
            consumer,
        } = self;
        let delivered = tx
            .send(Box::new(move |ctx: &mut C, reactor: &mut Reactor<C>| {
                drop(token);
                consumer(ctx, reactor, res)
            }))
            .is_ok();
        if !delivered {
            debug!("reply dropped, the event loop is gone");
        }
    }
}

//------------ Reactor -------------------------------------------------------

pub struct Reactor<C> {
    timers: TimerQueue<C>,
    tx: UnboundedSender<Event<C>>,
    rx: Option<UnboundedReceiver<Event<C>>>,
    /// Cloned into every handle and reply; a strong count above one means
    /// event sources are registered.
    sources: Arc<()>,
    catch_signals: bool,
    exit: bool,
}

impl<C: 'static> Reactor<C> {
    /// Creates a reactor that maps SIGINT/SIGTERM to the exit sentinel.
    pub fn new() -> Self {
        Self::create(true)
    }

    /// Creates a reactor that leaves process signals alone.
    pub fn without_signals() -> Self {
        Self::create(false)
    }

    fn create(catch_signals: bool) -> Self {
        let (tx, rx) = unbounded_channel();
        Reactor {
            timers: TimerQueue::default(),
            tx,
            rx: Some(rx),
            sources: Arc::new(()),
            catch_signals,
            exit: false,
        }
    }

    /// The timer queue owned by this reactor.
    pub fn timers(&mut self) -> &mut TimerQueue<C> {
        &mut self.timers
    }

    /// Mints an event injector registered as an event source.
    pub fn handle(&self) -> ReactorHandle<C> {
        ReactorHandle {
            tx: self.tx.clone(),
            token: self.sources.clone(),
        }
    }

    /// An injector that does not count as an event source, so holding it
    /// does not keep an otherwise idle loop alive. Used for the signal
    /// watchers.
    fn detached_handle(&self) -> ReactorHandle<C> {
        ReactorHandle {
            tx: self.tx.clone(),
            token: Arc::new(()),
        }
    }

    /// Builds the callback/errback pair for one collaborator operation.
    pub fn reply<T, F>(&self, consumer: F) -> Reply<C, T>
    where
        T: Send + 'static,
        F: FnOnce(&mut C, &mut Reactor<C>, Result<T, Error>)
            + Send
            + 'static,
    {
        Reply {
            tx: self.tx.clone(),
            token: self.sources.clone(),
            consumer: Box::new(consumer),
        }
    }

    /// Schedules an event through a zero-delay timer, letting the loop have
    /// a turn first.
    pub fn defer(&mut self, event: Event<C>) {
        self.timers.arm_in(chrono::Duration::zero(), |ctx, reactor| {
            event(ctx, reactor);
            Ok(())
        });
    }

    /// Makes the current `run` call return once control is back with the
    /// loop.
    pub fn exit(&mut self) {
        self.exit = true;
    }

    /// Runs the loop to completion.
    ///
    /// Returns when no event sources and no timers remain, or when the exit
    /// sentinel was seen. The only error is the fatal multiplexer condition.
    pub fn run(&mut self, ctx: &mut C) -> Result<(), FatalError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| FatalError::Runtime(e.to_string()))?;
        let mut rx = self.rx.take().expect("reactor is already running");
        let res = rt.block_on(self.run_loop(ctx, &mut rx));
        self.rx = Some(rx);
        res
    }

    async fn run_loop(
        &mut self,
        ctx: &mut C,
        rx: &mut UnboundedReceiver<Event<C>>,
    ) -> Result<(), FatalError> {
        let signal_watch = if self.catch_signals {
            spawn_signal_watch(self.detached_handle())
        } else {
            Vec::new()
        };

        self.exit = false;
        let result = loop {
            if self.exit {
                debug!("event loop exiting");
                break Ok(());
            }
            if self.timers.is_empty()
                && Arc::strong_count(&self.sources) == 1
                && rx.is_empty()
            {
                break Ok(());
            }

            let event = match self.timers.wakeup_delay(Time::now()) {
                Some(delay) if delay.is_zero() => match rx.try_recv() {
                    Ok(event) => Some(event),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => {
                        break Err(FatalError::MultiplexerClosed)
                    }
                },
                Some(delay) => {
                    match tokio::time::timeout(delay, rx.recv()).await {
                        Ok(Some(event)) => Some(event),
                        Ok(None) => {
                            break Err(FatalError::MultiplexerClosed)
                        }
                        Err(_) => None,
                    }
                }
                None => match rx.recv().await {
                    Some(event) => Some(event),
                    None => break Err(FatalError::MultiplexerClosed),
                },
            };

            if let Some(event) = event {
                self.dispatch(ctx, event);
            }
            if self.exit {
                debug!("event loop exiting");
                break Ok(());
            }
            self.run_due_timers(ctx);
        };

        for watch in signal_watch {
            watch.abort();
        }
        if let Err(e) = &result {
            error!("{e}");
        }
        result
    }

    /// Runs an injected event.
    ///
    /// A panic escaping the event is logged and the loop restarts; it is
    /// treated as a recoverable defect.
    fn dispatch(&mut self, ctx: &mut C, event: Event<C>) {
        let outcome =
            catch_unwind(AssertUnwindSafe(|| event(ctx, &mut *self)));
        if outcome.is_err() {
            error!(
                "event handler panicked, this is not supposed to happen, \
                 restarting the event loop pass"
            );
        }
    }

    /// Fires every timer due at one snapshot of now.
    fn run_due_timers(&mut self, ctx: &mut C) {
        let due = self.timers.take_due(Time::now());
        for entry in due {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                TimerQueue::run_entry(entry, ctx, &mut *self)
            }));
            if outcome.is_err() {
                error!(
                    "timer handler panicked, this is not supposed to \
                     happen, restarting the event loop pass"
                );
            }
        }
    }
}

//------------ Signal handling -----------------------------------------------

fn spawn_signal_watch<C: 'static>(
    handle: ReactorHandle<C>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut watchers = Vec::new();

    {
        let handle = handle.clone();
        watchers.push(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, exiting event loop");
                handle.shutdown();
            }
        }));
    }

    #[cfg(unix)]
    watchers.push(tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                if term.recv().await.is_some() {
                    info!("termination signal received, exiting event loop");
                    handle.shutdown();
                }
            }
            Err(e) => warn!("cannot install SIGTERM handler: {e}"),
        }
    }));

    watchers
}

//------------ sync_call -----------------------------------------------------

/// Adapts one callback/errback-style operation into a blocking call.
///
/// Spins up a private reactor, defers the start of the operation, runs the
/// loop to completion and returns the captured result or re-raises the
/// captured failure. Must not be invoked from inside a running reactor.
pub fn sync_call<C, T, F>(ctx: &mut C, op: F) -> CoralResult<T>
where
    C: 'static,
    T: Send + 'static,
    F: FnOnce(&mut C, &mut Reactor<C>, Reply<C, T>) + Send + 'static,
{
    let mut reactor = Reactor::without_signals();
    let slot: Arc<Mutex<Option<Result<T, Error>>>> =
        Arc::new(Mutex::new(None));

    let result_slot = slot.clone();
    let reply =
        reactor.reply(move |_ctx: &mut C, reactor: &mut Reactor<C>, res| {
            *result_slot.lock().unwrap() = Some(res);
            reactor.exit();
        });

    reactor.defer(Box::new(move |ctx, reactor| op(ctx, reactor, reply)));
    reactor.run(ctx).map_err(Error::custom)?;

    let res = slot.lock().unwrap().take();
    match res {
        Some(res) => res,
        None => {
            warn!("event loop terminated without callback or errback");
            Err(Error::ReactorGone)
        }
    }
}

//============ Tests =========================================================
