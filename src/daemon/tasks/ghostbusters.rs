//! Generate or update Ghostbuster records for a CA.
//!
//! Based on the ROA update workflow, but without its scaling machinery:
//! the desired set is reconciled in one pass.

use std::sync::{Arc, Mutex};

use log::{debug, error};

use crate::commons::api::GhostbusterRequest;
use crate::daemon::ca::PublicationQueue;
use crate::daemon::caserver::CaServer;
use crate::daemon::scheduler::Task;
use crate::daemon::tasks;
use crate::runtime::Reactor;

pub fn start(
    task: Task,
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
) {
    let handle = task.tenant();
    debug!("CA '{handle}' updating ghostbuster records");

    let parents = match ctx.ca(&handle) {
        Ok(ca) => ca.parent_handles(),
        Err(e) => {
            error!("cannot update ghostbuster records: {e}");
            task.exit(ctx, reactor);
            return;
        }
    };

    let irdb = ctx.irdb();
    let got_task = task.clone();
    let reply = reactor.reply(move |ctx, reactor, res| match res {
        Ok(requests) => got_requests(ctx, reactor, got_task, requests),
        Err(e) => {
            error!(
                "could not fetch ghostbuster requests for '{}', \
                 skipping: {}",
                got_task.tenant(),
                e
            );
            got_task.exit(ctx, reactor);
        }
    });
    irdb.ghostbuster_requests(&handle, parents, reply);
}

fn got_requests(
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
    task: Task,
    requests: Vec<GhostbusterRequest>,
) {
    let handle = task.tenant();
    let publisher = Arc::new(Mutex::new(PublicationQueue::default()));
    let signer = ctx.signer();
    let crl_interval = ctx.config().crl_interval();

    let result = {
        let mut queue = publisher.lock().unwrap();
        ctx.ca_mut(&handle).and_then(|ca| {
            let touched = ca.reconcile_ghostbusters(
                requests,
                &*signer,
                &mut queue,
            )?;
            for key in touched {
                ca.generate_crl_and_manifest(
                    &key,
                    &*signer,
                    &mut queue,
                    crl_interval,
                )?;
            }
            Ok(())
        })
    };

    match result {
        Ok(()) => tasks::flush_and_exit(&task, &publisher, ctx, reactor),
        Err(e) => {
            error!(
                "could not update ghostbuster records for '{handle}', \
                 skipping: {e}"
            );
            task.exit(ctx, reactor);
        }
    }
}
