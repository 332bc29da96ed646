//! Deadline-ordered one-shot timers.
//!
//! The queue is owned by a reactor instance rather than being process
//! global, so tests can drive one directly with a virtual clock.

use std::time::Duration;

use log::warn;
use rpki::repository::x509::Time;

use crate::commons::error::Error;

use super::reactor::Reactor;

//------------ Handler types -------------------------------------------------

pub type TimerHandler<C> =
    Box<dyn FnOnce(&mut C, &mut Reactor<C>) -> Result<(), Error> + Send>;

pub type TimerErrback<C> =
    Box<dyn FnOnce(&mut C, &mut Reactor<C>, Error) + Send>;

//------------ Timer ---------------------------------------------------------

/// A token identifying an armed timer, used to cancel or re-arm it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Timer(u64);

//------------ TimerEntry ----------------------------------------------------

pub struct TimerEntry<C> {
    id: u64,
    when: Time,
    handler: TimerHandler<C>,
    errback: Option<TimerErrback<C>>,
}

impl<C> TimerEntry<C> {
    pub fn id(&self) -> Timer {
        Timer(self.id)
    }

    pub fn when(&self) -> Time {
        self.when
    }

    pub fn into_handlers(self) -> (TimerHandler<C>, Option<TimerErrback<C>>) {
        (self.handler, self.errback)
    }
}

//------------ TimerQueue ----------------------------------------------------

/// The deadline-ordered collection of armed timers.
pub struct TimerQueue<C> {
    next_id: u64,
    /// Kept sorted by deadline, ties broken by arming order.
    entries: Vec<TimerEntry<C>>,
}

impl<C> Default for TimerQueue<C> {
    fn default() -> Self {
        TimerQueue {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<C> TimerQueue<C> {
    /// Arms a one-shot timer at an absolute deadline.
    pub fn arm_at<F>(&mut self, when: Time, handler: F) -> Timer
    where
        F: FnOnce(&mut C, &mut Reactor<C>) -> Result<(), Error>
            + Send
            + 'static,
    {
        self.insert(when, Box::new(handler), None)
    }

    /// Arms a one-shot timer at a deadline relative to now.
    pub fn arm_in<F>(&mut self, delay: chrono::Duration, handler: F) -> Timer
    where
        F: FnOnce(&mut C, &mut Reactor<C>) -> Result<(), Error>
            + Send
            + 'static,
    {
        self.arm_at(Time::now() + delay, handler)
    }

    /// Arms a timer with an error handler that receives a handler failure.
    pub fn arm_at_with_errback<F, E>(
        &mut self,
        when: Time,
        handler: F,
        errback: E,
    ) -> Timer
    where
        F: FnOnce(&mut C, &mut Reactor<C>) -> Result<(), Error>
            + Send
            + 'static,
        E: FnOnce(&mut C, &mut Reactor<C>, Error) + Send + 'static,
    {
        self.insert(when, Box::new(handler), Some(Box::new(errback)))
    }

    fn insert(
        &mut self,
        when: Time,
        handler: TimerHandler<C>,
        errback: Option<TimerErrback<C>>,
    ) -> Timer {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(TimerEntry {
            id,
            when,
            handler,
            errback,
        });
        self.sort();
        Timer(id)
    }

    fn sort(&mut self) {
        self.entries
            .sort_by_key(|e| (e.when.timestamp_millis(), e.id));
    }

    /// Moves an armed timer to a new deadline, keeping its handler.
    ///
    /// Returns false if the timer is no longer armed.
    pub fn set(&mut self, timer: Timer, when: Time) -> bool {
        match self.entries.iter_mut().find(|e| e.id == timer.0) {
            Some(entry) => {
                entry.when = when;
                self.sort();
                true
            }
            None => false,
        }
    }

    /// Cancels a timer, if it was set.
    pub fn cancel(&mut self, timer: Timer) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != timer.0);
        self.entries.len() != before
    }

    /// Tests whether this timer is currently armed.
    pub fn is_set(&self, timer: Timer) -> bool {
        self.entries.iter().any(|e| e.id == timer.0)
    }

    /// Cancels every timer on the queue.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The deadlines currently armed, soonest first.
    pub fn deadlines(&self) -> impl Iterator<Item = Time> + '_ {
        self.entries.iter().map(|e| e.when)
    }

    /// Takes every timer whose deadline is at or before the given snapshot
    /// of "now" off the queue.
    ///
    /// Comparisons are made against the snapshot so that even if new timers
    /// keep getting armed while the due ones run, control returns to the
    /// I/O loop reasonably quickly.
    pub fn take_due(&mut self, now: Time) -> Vec<TimerEntry<C>> {
        let due = self
            .entries
            .iter()
            .take_while(|e| e.when <= now)
            .count();
        self.entries.drain(..due).collect()
    }

    /// The delay until the next timer expires, or `None` if no timers are
    /// armed and the caller should wait indefinitely.
    ///
    /// Rounds up to whole seconds to avoid spinning in the I/O wait.
    pub fn wakeup_delay(&self, now: Time) -> Option<Duration> {
        let first = self.entries.first()?;
        if first.when <= now {
            return Some(Duration::ZERO);
        }
        let millis = first.when.timestamp_millis() - now.timestamp_millis();
        let seconds = (millis as u64).div_ceil(1000);
        Some(Duration::from_secs(seconds))
    }

    /// Runs a single due timer entry against the context.
    ///
    /// A handler error routes to the errback if one was given, otherwise it
    /// is logged and swallowed. It never aborts the caller.
    pub fn run_entry(
        entry: TimerEntry<C>,
        ctx: &mut C,
        reactor: &mut Reactor<C>,
    ) {
        let (handler, errback) = entry.into_handlers();
        if let Err(e) = handler(ctx, reactor) {
            match errback {
                Some(errback) => errback(ctx, reactor, e),
                None => warn!("unhandled error from timer handler: {e}"),
            }
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(
    ) -> impl FnOnce(&mut (), &mut Reactor<()>) -> Result<(), Error> + Send
    {
        |_, _| Ok(())
    }

    #[test]
    fn deadlines_are_non_decreasing() {
        let mut queue: TimerQueue<()> = TimerQueue::default();
        let now = Time::now();

        queue.arm_at(now + chrono::Duration::seconds(30), noop());
        queue.arm_at(now + chrono::Duration::seconds(10), noop());
        queue.arm_at(now + chrono::Duration::seconds(20), noop());

        let deadlines: Vec<i64> =
            queue.deadlines().map(|t| t.timestamp()).collect();
        let mut sorted = deadlines.clone();
        sorted.sort();
        assert_eq!(deadlines, sorted);
    }

    #[test]
    fn take_due_respects_snapshot() {
        let mut queue: TimerQueue<()> = TimerQueue::default();
        let now = Time::now();

        queue.arm_at(now - chrono::Duration::seconds(5), noop());
        queue.arm_at(now, noop());
        queue.arm_at(now + chrono::Duration::seconds(60), noop());

        let due = queue.take_due(now);
        assert_eq!(due.len(), 2);
        assert_eq!(queue.len(), 1);

        // the leftover timer is after the snapshot
        assert!(queue.deadlines().all(|t| t > now));
    }

    #[test]
    fn wakeup_delay_rounds_up() {
        let mut queue: TimerQueue<()> = TimerQueue::default();
        let now = Time::now();
        assert_eq!(queue.wakeup_delay(now), None);

        queue.arm_at(now + chrono::Duration::milliseconds(1500), noop());
        assert_eq!(queue.wakeup_delay(now), Some(Duration::from_secs(2)));

        queue.clear();
        queue.arm_at(now - chrono::Duration::seconds(1), noop());
        assert_eq!(queue.wakeup_delay(now), Some(Duration::ZERO));
    }

    #[test]
    fn cancel_and_rearm() {
        let mut queue: TimerQueue<()> = TimerQueue::default();
        let now = Time::now();

        let early = queue.arm_at(now + chrono::Duration::seconds(10), noop());
        let late = queue.arm_at(now + chrono::Duration::seconds(20), noop());

        assert!(queue.is_set(early));
        assert!(queue.cancel(early));
        assert!(!queue.is_set(early));
        assert!(!queue.cancel(early));

        // re-arming moves the timer to the front
        assert!(queue.set(late, now + chrono::Duration::seconds(1)));
        assert_eq!(
            queue.wakeup_delay(now),
            Some(Duration::from_secs(1))
        );

        queue.clear();
        assert!(queue.is_empty());
        assert!(!queue.set(late, now));
    }
}
