//! Continuation-based iteration for event-driven code.
//!
//! Drives a sequence through a per-item handler which calls
//! [`Iteration::resume`] when it is ready to advance, letting I/O waits
//! interleave between items without blocking the reactor thread.

use std::sync::{Arc, Mutex};

use super::reactor::Reactor;

//------------ Handler types -------------------------------------------------

type ItemFn<C, T> =
    Arc<dyn Fn(&mut C, &mut Reactor<C>, Iteration<C, T>, T) + Send + Sync>;

type DoneFn<C> = Box<dyn FnOnce(&mut C, &mut Reactor<C>) + Send>;

//------------ IterSource ----------------------------------------------------

enum IterSource<T> {
    /// A generic sequence.
    Items(Box<dyn Iterator<Item = T> + Send>),
    /// A list consumed destructively from the front, releasing memory as
    /// the iteration proceeds. For very large or memory-sensitive
    /// sequences.
    PopFront(Vec<T>),
}

impl<T> IterSource<T> {
    fn next(&mut self) -> Option<T> {
        match self {
            IterSource::Items(iter) => iter.next(),
            IterSource::PopFront(list) => {
                if list.is_empty() {
                    None
                } else {
                    Some(list.remove(0))
                }
            }
        }
    }
}

//------------ Iteration -----------------------------------------------------

/// The driver of one sequence. Cheap to clone; handlers receive a clone to
/// resume with.
pub struct Iteration<C, T> {
    state: Arc<Mutex<IterState<C, T>>>,
}

impl<C, T> Clone for Iteration<C, T> {
    fn clone(&self) -> Self {
        Iteration {
            state: self.state.clone(),
        }
    }
}

struct IterState<C, T> {
    source: IterSource<T>,
    item_handler: ItemFn<C, T>,
    done_handler: Option<DoneFn<C>>,
    /// Whether resumption defers through a zero-delay timer to unwind the
    /// call stack.
    defer: bool,
}

impl<C: 'static, T: Send + 'static> Iteration<C, T> {
    /// Starts iterating a generic sequence. The first step happens
    /// immediately; resumption is deferred through a zero-delay timer.
    pub fn over<I, F, D>(
        items: I,
        item_handler: F,
        done_handler: D,
        ctx: &mut C,
        reactor: &mut Reactor<C>,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        F: Fn(&mut C, &mut Reactor<C>, Iteration<C, T>, T)
            + Send
            + Sync
            + 'static,
        D: FnOnce(&mut C, &mut Reactor<C>) + Send + 'static,
    {
        Self::start(
            IterSource::Items(Box::new(items.into_iter())),
            true,
            item_handler,
            done_handler,
            ctx,
            reactor,
        )
    }

    /// Like [`Iteration::over`], but resumption advances inline. For tight
    /// loops with no I/O between items.
    pub fn over_inline<I, F, D>(
        items: I,
        item_handler: F,
        done_handler: D,
        ctx: &mut C,
        reactor: &mut Reactor<C>,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        F: Fn(&mut C, &mut Reactor<C>, Iteration<C, T>, T)
            + Send
            + Sync
            + 'static,
        D: FnOnce(&mut C, &mut Reactor<C>) + Send + 'static,
    {
        Self::start(
            IterSource::Items(Box::new(items.into_iter())),
            false,
            item_handler,
            done_handler,
            ctx,
            reactor,
        )
    }

    /// Starts iterating a list consumed destructively from the front.
    pub fn drain<F, D>(
        items: Vec<T>,
        item_handler: F,
        done_handler: D,
        ctx: &mut C,
        reactor: &mut Reactor<C>,
    ) -> Self
    where
        F: Fn(&mut C, &mut Reactor<C>, Iteration<C, T>, T)
            + Send
            + Sync
            + 'static,
        D: FnOnce(&mut C, &mut Reactor<C>) + Send + 'static,
    {
        Self::start(
            IterSource::PopFront(items),
            true,
            item_handler,
            done_handler,
            ctx,
            reactor,
        )
    }

    fn start<F, D>(
        source: IterSource<T>,
        defer: bool,
        item_handler: F,
        done_handler: D,
        ctx: &mut C,
        reactor: &mut Reactor<C>,
    ) -> Self
    where
        F: Fn(&mut C, &mut Reactor<C>, Iteration<C, T>, T)
            + Send
            + Sync
            + 'static,
        D: FnOnce(&mut C, &mut Reactor<C>) + Send + 'static,
    {
        let iteration = Iteration {
            state: Arc::new(Mutex::new(IterState {
                source,
                item_handler: Arc::new(item_handler),
                done_handler: Some(Box::new(done_handler)),
                defer,
            })),
        };
        iteration.step(ctx, reactor);
        iteration
    }

    /// Advances to the next item, or to the completion callback on
    /// exhaustion.
    pub fn resume(&self, ctx: &mut C, reactor: &mut Reactor<C>) {
        let defer = self.state.lock().unwrap().defer;
        if defer {
            let iteration = self.clone();
            reactor.defer(Box::new(move |ctx, reactor| {
                iteration.step(ctx, reactor)
            }));
        } else {
            self.step(ctx, reactor);
        }
    }

    fn step(&self, ctx: &mut C, reactor: &mut Reactor<C>) {
        let next = {
            let mut state = self.state.lock().unwrap();
            let handler = state.item_handler.clone();
            state.source.next().map(|item| (handler, item))
        };
        match next {
            Some((handler, item)) => {
                handler(ctx, reactor, self.clone(), item)
            }
            None => {
                let done = self.state.lock().unwrap().done_handler.take();
                if let Some(done) = done {
                    done(ctx, reactor);
                }
            }
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestCtx {
        items: Vec<u32>,
        done: u32,
    }

    #[test]
    fn drives_all_items_then_done_once() {
        let mut ctx = TestCtx::default();
        let mut reactor: Reactor<TestCtx> = Reactor::without_signals();

        Iteration::over(
            vec![1u32, 2, 3],
            |ctx: &mut TestCtx, reactor, iter: Iteration<_, u32>, item| {
                ctx.items.push(item);
                iter.resume(ctx, reactor);
            },
            |ctx: &mut TestCtx, _| ctx.done += 1,
            &mut ctx,
            &mut reactor,
        );

        reactor.run(&mut ctx).unwrap();
        assert_eq!(ctx.items, vec![1, 2, 3]);
        assert_eq!(ctx.done, 1);
    }

    #[test]
    fn drain_consumes_the_list_from_the_front() {
        let mut ctx = TestCtx::default();
        let mut reactor: Reactor<TestCtx> = Reactor::without_signals();

        let iteration = Iteration::drain(
            vec![10u32, 20, 30],
            |ctx: &mut TestCtx, reactor, iter: Iteration<_, u32>, item| {
                ctx.items.push(item);
                iter.resume(ctx, reactor);
            },
            |ctx: &mut TestCtx, _| ctx.done += 1,
            &mut ctx,
            &mut reactor,
        );

        // the first step ran immediately and consumed the front item
        {
            let state = iteration.state.lock().unwrap();
            match &state.source {
                IterSource::PopFront(list) => assert_eq!(list.len(), 2),
                _ => unreachable!(),
            }
        }

        reactor.run(&mut ctx).unwrap();
        assert_eq!(ctx.items, vec![10, 20, 30]);
        assert_eq!(ctx.done, 1);
    }

    #[test]
    fn empty_sequence_completes_immediately() {
        let mut ctx = TestCtx::default();
        let mut reactor: Reactor<TestCtx> = Reactor::without_signals();

        Iteration::over(
            Vec::<u32>::new(),
            |_: &mut TestCtx, _, _, _| unreachable!("no items expected"),
            |ctx: &mut TestCtx, _| ctx.done += 1,
            &mut ctx,
            &mut reactor,
        );

        // construction performed the (only) step already
        assert_eq!(ctx.done, 1);
    }

    #[test]
    fn inline_mode_advances_without_the_reactor() {
        let mut ctx = TestCtx::default();
        let mut reactor: Reactor<TestCtx> = Reactor::without_signals();

        Iteration::over_inline(
            vec![1u32, 2, 3, 4],
            |ctx: &mut TestCtx, reactor, iter: Iteration<_, u32>, item| {
                ctx.items.push(item);
                iter.resume(ctx, reactor);
            },
            |ctx: &mut TestCtx, _| ctx.done += 1,
            &mut ctx,
            &mut reactor,
        );

        // everything ran during construction
        assert_eq!(ctx.items, vec![1, 2, 3, 4]);
        assert_eq!(ctx.done, 1);
    }
}
