//! Generate or update end entity certificates for a CA.

use std::sync::{Arc, Mutex};

use log::{debug, error};

use crate::commons::api::EeCertRequest;
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
    debug!("CA '{handle}' updating EE certificates");

    let irdb = ctx.irdb();
    let got_task = task.clone();
    let reply = reactor.reply(move |ctx, reactor, res| match res {
        Ok(requests) => got_requests(ctx, reactor, got_task, requests),
        Err(e) => {
            error!(
                "could not fetch EE certificate requests for '{}', \
                 skipping: {}",
                got_task.tenant(),
                e
            );
            got_task.exit(ctx, reactor);
        }
    });
    irdb.ee_certificate_requests(&handle, reply);
}

fn got_requests(
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
    task: Task,
    requests: Vec<EeCertRequest>,
) {
    let handle = task.tenant();
    let publisher = Arc::new(Mutex::new(PublicationQueue::default()));
    let signer = ctx.signer();
    let crl_interval = ctx.config().crl_interval();

    let result = {
        let mut queue = publisher.lock().unwrap();
        ctx.ca_mut(&handle).and_then(|ca| {
            let touched =
                ca.reconcile_ee_certs(requests, &*signer, &mut queue)?;
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
                "could not update EE certificates for '{handle}', \
                 skipping: {e}"
            );
            task.exit(ctx, reactor);
        }
    }
}
