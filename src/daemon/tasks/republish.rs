//! Regenerate CRLs and manifests before they go stale, and clean up
//! tombstones left behind by revoked signing keys.

use std::sync::{Arc, Mutex};

use log::{debug, warn};
use rpki::repository::x509::Time;

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
    debug!("CA '{handle}' regenerating CRLs and manifests");

    let now = Time::now();
    let threshold = now + ctx.config().crl_regen_margin();
    let crl_interval = ctx.config().crl_interval();
    let signer = ctx.signer();
    let publisher = Arc::new(Mutex::new(PublicationQueue::default()));

    {
        let mut queue = publisher.lock().unwrap();
        match ctx.ca_mut(&handle) {
            Ok(ca) => {
                ca.purge_revoked_tombstones(now, &mut queue);
                for key in ca.stale_crl_keys(threshold) {
                    if let Err(e) = ca.generate_crl_and_manifest(
                        &key,
                        &*signer,
                        &mut queue,
                        crl_interval,
                    ) {
                        warn!(
                            "could not regenerate CRL and manifest for \
                             key {key}, skipping: {e}"
                        );
                    }
                }
            }
            Err(e) => {
                warn!("cannot regenerate CRLs and manifests: {e}")
            }
        }
    }

    ctx.sweep();
    tasks::flush_and_exit(&task, &publisher, ctx, reactor);
}
