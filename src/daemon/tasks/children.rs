//! Check for updated desired resources for all of a CA's children and
//! reissue, revoke or expire issued certificates as necessary.

use std::sync::{Arc, Mutex};

use log::{debug, warn};
use rpki::ca::idexchange::{CaHandle, ChildHandle};
use rpki::repository::x509::Time;

use crate::daemon::ca::{call_pubd, PublicationQueue};
use crate::daemon::caserver::CaServer;
use crate::daemon::scheduler::Task;
use crate::daemon::tasks;
use crate::runtime::{Iteration, Reactor};

pub fn start(
    task: Task,
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
) {
    let handle = task.tenant();
    let children = match ctx.ca(&handle) {
        Ok(ca) => ca.child_handles(),
        Err(e) => {
            warn!("cannot update children: {e}");
            task.exit(ctx, reactor);
            return;
        }
    };
    debug!("CA '{}' updating {} children", handle, children.len());

    let now = Time::now();
    let regen_threshold = now + ctx.config().child_regen_margin();
    let publisher = Arc::new(Mutex::new(PublicationQueue::default()));

    let item_task = task.clone();
    let item_handle = handle.clone();
    let item_publisher = publisher.clone();
    let done_task = task.clone();
    let done_publisher = publisher.clone();

    Iteration::over(
        children,
        move |ctx: &mut CaServer,
              reactor: &mut Reactor<CaServer>,
              children_iter,
              child: ChildHandle| {
            if item_task.overdue() {
                // flush what accumulated so far, then yield and pick this
                // child up again
                let task = item_task.clone();
                let handle = item_handle.clone();
                let publisher = item_publisher.clone();
                let cont_now = now;
                let cont_threshold = regen_threshold;
                call_pubd(
                    &item_publisher,
                    item_handle.clone(),
                    ctx,
                    reactor,
                    Box::new(move |ctx, reactor| {
                        task.postpone(
                            Box::new(move |ctx, reactor| {
                                do_child(
                                    ctx,
                                    reactor,
                                    handle,
                                    child,
                                    children_iter,
                                    publisher,
                                    cont_now,
                                    cont_threshold,
                                );
                            }),
                            ctx,
                            reactor,
                        );
                    }),
                    tasks::publication_failed(item_task.clone()),
                );
            } else {
                do_child(
                    ctx,
                    reactor,
                    item_handle.clone(),
                    child,
                    children_iter,
                    item_publisher.clone(),
                    now,
                    regen_threshold,
                );
            }
        },
        move |ctx: &mut CaServer, reactor: &mut Reactor<CaServer>| {
            tasks::flush_and_exit(&done_task, &done_publisher, ctx, reactor);
        },
        ctx,
        reactor,
    );
}

/// Fetches the desired resources for one child and diffs its issued
/// certificates against them.
#[allow(clippy::too_many_arguments)]
fn do_child(
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
    handle: CaHandle,
    child: ChildHandle,
    children_iter: Iteration<CaServer, ChildHandle>,
    publisher: Arc<Mutex<PublicationQueue>>,
    now: Time,
    regen_threshold: Time,
) {
    let has_certs = ctx
        .ca(&handle)
        .map(|ca| ca.child_has_certs(&child))
        .unwrap_or(false);
    if !has_certs {
        children_iter.resume(ctx, reactor);
        return;
    }

    let irdb = ctx.irdb();
    let query_handle = handle.clone();
    let query_child = child.clone();
    let reply = reactor.reply(move |ctx: &mut CaServer, reactor, res| {
        match res {
            Ok(entitlement) => {
                let signer = ctx.signer();
                let crl_interval = ctx.config().crl_interval();
                let result = {
                    let mut publisher = publisher.lock().unwrap();
                    ctx.ca_mut(&handle).and_then(|ca| {
                        ca.update_child(
                            &child,
                            &entitlement,
                            now,
                            regen_threshold,
                            &*signer,
                            &mut publisher,
                            crl_interval,
                        )
                    })
                };
                if let Err(e) = result {
                    warn!("could not update child '{child}', skipping: {e}");
                }
                children_iter.resume(ctx, reactor);
            }
            Err(e) => {
                warn!(
                    "could not get resources for child '{child}', \
                     skipping: {e}"
                );
                children_iter.resume(ctx, reactor);
            }
        }
    });
    irdb.child_resources(&query_handle, &query_child, reply);
}
