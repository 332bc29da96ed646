//! The cooperative runtime: a single-threaded reactor with deadline-ordered
//! timers, continuation-based iteration and channel-injected events.
//!
//! Everything in this module is generic over the context type `C` that is
//! threaded through every handler, so that the primitives can be driven with
//! a small test context as easily as with the full engine.

pub mod iter;
pub mod reactor;
pub mod timer;

pub use self::iter::Iteration;
pub use self::reactor::{
    sync_call, Event, FatalError, Reactor, ReactorHandle, Reply,
};
pub use self::timer::{Timer, TimerQueue};
