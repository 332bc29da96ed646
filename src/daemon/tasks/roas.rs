//! Generate or update ROAs for a CA from the desired set in the IRDB.
//!
//! This is the task with the real scaling exposure: the update list is
//! consumed destructively from the front, and accumulated publication
//! operations are flushed whenever the task has run past its time-slice,
//! after which it postpones and resumes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use rpki::ca::idexchange::CaHandle;
use rpki::crypto::KeyIdentifier;

use crate::commons::api::RoaPayload;
use crate::commons::error::Error;
use crate::daemon::ca::{call_pubd, PublicationQueue};
use crate::daemon::caserver::CaServer;
use crate::daemon::scheduler::{Cont, Task};
use crate::daemon::tasks;
use crate::runtime::{Iteration, Reactor};

/// The shared state of one run.
#[derive(Clone)]
struct RoaRun {
    task: Task,
    handle: CaHandle,
    publisher: Arc<Mutex<PublicationQueue>>,
    /// Signing keys whose object set changed; their CRL and manifest are
    /// regenerated before each flush.
    touched: Arc<Mutex<HashSet<KeyIdentifier>>>,
    orphans: Arc<Mutex<Vec<u64>>>,
}

pub fn start(
    task: Task,
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
) {
    let handle = task.tenant();
    debug!("CA '{handle}' updating ROAs, querying for ROA requests");

    let irdb = ctx.irdb();
    let got_task = task.clone();
    let reply = reactor.reply(move |ctx, reactor, res| match res {
        Ok(requests) => got_roa_requests(ctx, reactor, got_task, requests),
        Err(e) => {
            error!(
                "could not fetch ROA requests for '{}', skipping: {}",
                got_task.tenant(),
                e
            );
            got_task.exit(ctx, reactor);
        }
    });
    irdb.roa_requests(&handle, reply);
}

fn got_roa_requests(
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
    task: Task,
    requests: Vec<RoaPayload>,
) {
    let handle = task.tenant();
    debug!(
        "received {} ROA requests for CA '{}'",
        requests.len(),
        handle
    );

    let (updates, orphans) = match ctx.ca_mut(&handle) {
        Ok(ca) => ca.prepare_roa_updates(requests),
        Err(e) => {
            warn!("cannot update ROAs: {e}");
            task.exit(ctx, reactor);
            return;
        }
    };

    let run = RoaRun {
        task,
        handle,
        publisher: Arc::new(Mutex::new(PublicationQueue::default())),
        touched: Arc::new(Mutex::new(HashSet::new())),
        orphans: Arc::new(Mutex::new(orphans)),
    };

    if run.task.overdue() {
        let resume = run.clone();
        run.task.clone().postpone(
            Box::new(move |ctx, reactor| {
                begin_loop(ctx, reactor, resume, updates)
            }),
            ctx,
            reactor,
        );
    } else {
        begin_loop(ctx, reactor, run, updates);
    }
}

fn begin_loop(
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
    run: RoaRun,
    updates: Vec<u64>,
) {
    let item_run = run.clone();
    let done_run = run.clone();

    Iteration::drain(
        updates,
        move |ctx: &mut CaServer,
              reactor: &mut Reactor<CaServer>,
              updates_iter,
              id: u64| {
            let run = item_run.clone();
            let signer = ctx.signer();
            let outcome = {
                let mut publisher = run.publisher.lock().unwrap();
                ctx.ca_mut(&run.handle).and_then(|ca| {
                    ca.update_roa(id, &*signer, &mut publisher)
                })
            };
            match outcome {
                Ok(Some(key)) => {
                    run.touched.lock().unwrap().insert(key);
                }
                Ok(None) => {}
                Err(Error::NoCoveringCert(what)) => {
                    warn!("no covering certificate for {what}, skipping")
                }
                Err(e) => warn!("could not update ROA, skipping: {e}"),
            }

            if run.task.overdue() {
                // flush, then yield before taking the next item
                let postpone_run = run.clone();
                publish(
                    ctx,
                    reactor,
                    run,
                    Box::new(move |ctx, reactor| {
                        let resume_iter = updates_iter.clone();
                        postpone_run.task.postpone(
                            Box::new(move |ctx, reactor| {
                                resume_iter.resume(ctx, reactor)
                            }),
                            ctx,
                            reactor,
                        );
                    }),
                );
            } else {
                updates_iter.resume(ctx, reactor);
            }
        },
        move |ctx: &mut CaServer, reactor: &mut Reactor<CaServer>| {
            roas_done(ctx, reactor, done_run);
        },
        ctx,
        reactor,
    );
}

/// Regenerates CRLs and manifests for every touched signing key, then
/// flushes the queued operations, then continues with `done`.
fn publish(
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
    run: RoaRun,
    done: Cont,
) {
    let queue_empty = run.publisher.lock().unwrap().is_empty();
    if queue_empty {
        run.touched.lock().unwrap().clear();
    } else {
        let mut keys: Vec<KeyIdentifier> =
            run.touched.lock().unwrap().drain().collect();
        keys.sort_by_key(|k| k.to_string());
        let signer = ctx.signer();
        let crl_interval = ctx.config().crl_interval();
        if let Ok(ca) = ctx.ca_mut(&run.handle) {
            let mut publisher = run.publisher.lock().unwrap();
            for key in keys {
                debug!(
                    "generating new CRL and manifest for signing key {key}"
                );
                if let Err(e) = ca.generate_crl_and_manifest(
                    &key,
                    &*signer,
                    &mut publisher,
                    crl_interval,
                ) {
                    warn!(
                        "could not regenerate CRL and manifest for key \
                         {key}: {e}"
                    );
                }
            }
        }
    }
    ctx.sweep();
    call_pubd(
        &run.publisher,
        run.handle.clone(),
        ctx,
        reactor,
        done,
        tasks::publication_failed(run.task.clone()),
    );
}

/// The update list is exhausted: revoke the orphans, then flush and exit.
fn roas_done(
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
    run: RoaRun,
) {
    let orphans: Vec<u64> = {
        let mut orphans = run.orphans.lock().unwrap();
        orphans.drain(..).collect()
    };
    if let Ok(ca) = ctx.ca_mut(&run.handle) {
        let mut publisher = run.publisher.lock().unwrap();
        let mut touched = run.touched.lock().unwrap();
        for id in orphans {
            if let Some(key) = ca.revoke_roa(id, &mut publisher) {
                touched.insert(key);
            }
        }
    }
    let exit_task = run.task.clone();
    publish(
        ctx,
        reactor,
        run,
        Box::new(move |ctx, reactor| exit_task.exit(ctx, reactor)),
    );
}
