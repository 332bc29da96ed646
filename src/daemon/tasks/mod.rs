//! The concrete reconciliation workflows the scheduler runs.
//!
//! Every task shares the same terminal shape: accumulated publish/withdraw
//! operations are flushed to the publication server in one batch, and a
//! batch failure is logged while the task still exits. Recovery is the next
//! scheduled cycle, or the failed-publication retry task.

pub mod children;
pub mod eecerts;
pub mod ghostbusters;
pub mod parents;
pub mod pubretry;
pub mod republish;
pub mod roas;

use std::sync::{Arc, Mutex};

use log::error;

use crate::daemon::ca::{call_pubd, FailedFn, PublicationQueue};
use crate::daemon::caserver::CaServer;
use crate::daemon::scheduler::{Task, TaskKind};
use crate::runtime::Reactor;

/// Dispatches a task to its workflow entry point.
pub(crate) fn start(
    kind: TaskKind,
    task: Task,
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
) {
    match kind {
        TaskKind::PollParents => parents::start(task, ctx, reactor),
        TaskKind::UpdateChildren => children::start(task, ctx, reactor),
        TaskKind::UpdateRoas => roas::start(task, ctx, reactor),
        TaskKind::UpdateGhostbusters => {
            ghostbusters::start(task, ctx, reactor)
        }
        TaskKind::UpdateEeCertificates => {
            eecerts::start(task, ctx, reactor)
        }
        TaskKind::RegenerateCrlsAndManifests => {
            republish::start(task, ctx, reactor)
        }
        TaskKind::CheckFailedPublication => {
            pubretry::start(task, ctx, reactor)
        }
    }
}

/// The shared "flush, then exit" tail.
pub(crate) fn flush_and_exit(
    task: &Task,
    publisher: &Arc<Mutex<PublicationQueue>>,
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
) {
    let done_task = task.clone();
    call_pubd(
        publisher,
        task.tenant(),
        ctx,
        reactor,
        Box::new(move |ctx, reactor| done_task.exit(ctx, reactor)),
        publication_failed(task.clone()),
    );
}

/// The shared publication failure tail: log, exit anyway. The operations
/// stay recorded as unconfirmed and are retried later.
pub(crate) fn publication_failed(task: Task) -> FailedFn {
    Box::new(move |ctx, reactor, e| {
        error!(
            "could not publish for CA '{}', skipping: {}",
            task.tenant(),
            e
        );
        task.exit(ctx, reactor);
    })
}
