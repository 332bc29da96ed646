//! Periodic check for objects we tried to publish but failed, e.g. because
//! the publication server was down or unreachable.

use std::sync::{Arc, Mutex};

use log::{info, warn};

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
    let publisher = Arc::new(Mutex::new(PublicationQueue::default()));

    {
        let mut queue = publisher.lock().unwrap();
        match ctx.ca(&handle) {
            Ok(ca) => {
                let pending = ca.unconfirmed_for_active_keys();
                if !pending.is_empty() {
                    info!(
                        "CA '{}' retrying {} unconfirmed publication \
                         elements",
                        handle,
                        pending.len()
                    );
                }
                for (key, element) in pending {
                    queue.requeue(key, element);
                }
            }
            Err(e) => warn!("cannot check failed publication: {e}"),
        }
    }

    ctx.sweep();
    tasks::flush_and_exit(&task, &publisher, ctx, reactor);
}
