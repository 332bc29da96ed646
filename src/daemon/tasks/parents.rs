//! Poll every parent for its authoritative resource class list and
//! reconcile the local CA shadows against it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use rpki::ca::idexchange::{CaHandle, ParentHandle};
use rpki::ca::provisioning::ResourceClassName;

use crate::commons::api::ClassEntitlement;
use crate::daemon::ca::PublicationQueue;
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
    let parents = match ctx.ca(&handle) {
        Ok(ca) => ca.parent_handles(),
        Err(e) => {
            warn!("cannot poll parents: {e}");
            task.exit(ctx, reactor);
            return;
        }
    };
    debug!("CA '{}' polling {} parents", handle, parents.len());

    let publisher = Arc::new(Mutex::new(PublicationQueue::default()));
    let done_task = task.clone();
    let done_publisher = publisher.clone();

    Iteration::over(
        parents,
        move |ctx: &mut CaServer,
              reactor: &mut Reactor<CaServer>,
              parents_iter,
              parent: ParentHandle| {
            let updown = ctx.updown();
            let handle = handle.clone();
            let publisher = publisher.clone();
            let query_handle = handle.clone();
            let query_parent = parent.clone();
            let reply = reactor.reply(move |ctx, reactor, res| match res {
                Ok(classes) => class_loop(
                    ctx,
                    reactor,
                    handle,
                    parent,
                    classes,
                    publisher,
                    parents_iter,
                ),
                Err(e) => {
                    warn!(
                        "could not get resource class list from parent \
                         '{parent}', skipping: {e}"
                    );
                    parents_iter.resume(ctx, reactor);
                }
            });
            updown.list(&query_handle, &query_parent, reply);
        },
        move |ctx: &mut CaServer, reactor: &mut Reactor<CaServer>| {
            tasks::flush_and_exit(&done_task, &done_publisher, ctx, reactor);
        },
        ctx,
        reactor,
    );
}

/// Walks the classes in the parent's answer: new classes become local CA
/// shadows, known classes reconcile, and shadows absent from the answer
/// are deleted afterwards. A failure on one class is logged and skipped,
/// never aborting its siblings.
fn class_loop(
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
    handle: CaHandle,
    parent: ParentHandle,
    classes: Vec<ClassEntitlement>,
    publisher: Arc<Mutex<PublicationQueue>>,
    parents_iter: Iteration<CaServer, ParentHandle>,
) {
    let known: Vec<ResourceClassName> = match ctx.ca(&handle) {
        Ok(ca) => ca.shadow_class_names(&parent),
        Err(e) => {
            warn!("cannot reconcile classes of parent '{parent}': {e}");
            parents_iter.resume(ctx, reactor);
            return;
        }
    };
    let mut leftover: HashSet<ResourceClassName> =
        known.into_iter().collect();
    for entitlement in &classes {
        leftover.remove(&entitlement.class_name);
    }

    let item_handle = handle.clone();
    let item_parent = parent.clone();
    let item_publisher = publisher.clone();

    Iteration::over(
        classes,
        move |ctx: &mut CaServer,
              reactor: &mut Reactor<CaServer>,
              class_iter,
              entitlement: ClassEntitlement| {
            let signer = ctx.signer();
            let crl_interval = ctx.config().crl_interval();
            let result = {
                let mut publisher = item_publisher.lock().unwrap();
                match ctx.ca_mut(&item_handle) {
                    Ok(ca) => {
                        if ca.has_shadow(
                            &item_parent,
                            &entitlement.class_name,
                        ) {
                            ca.reconcile_shadow(
                                &item_parent,
                                &entitlement,
                                &*signer,
                                &mut publisher,
                                crl_interval,
                            )
                        } else {
                            ca.create_shadow(
                                &item_parent,
                                &entitlement,
                                &*signer,
                                &mut publisher,
                                crl_interval,
                            )
                        }
                    }
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = result {
                warn!(
                    "could not update resource class '{}' under parent \
                     '{}', skipping: {}",
                    entitlement.class_name, item_parent, e
                );
            }
            class_iter.resume(ctx, reactor);
        },
        move |ctx: &mut CaServer, reactor: &mut Reactor<CaServer>| {
            delete_leftovers(
                ctx, reactor, handle, parent, leftover, publisher,
                parents_iter,
            );
        },
        ctx,
        reactor,
    );
}

/// Deletes local CA shadows the parent's answer no longer lists and asks
/// the parent to revoke their keys.
fn delete_leftovers(
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
    handle: CaHandle,
    parent: ParentHandle,
    leftover: HashSet<ResourceClassName>,
    publisher: Arc<Mutex<PublicationQueue>>,
    parents_iter: Iteration<CaServer, ParentHandle>,
) {
    let updown = ctx.updown();
    let mut class_names: Vec<ResourceClassName> =
        leftover.into_iter().collect();
    class_names.sort_by_key(|c| c.to_string());

    for class_name in class_names {
        let deleted = {
            let mut publisher = publisher.lock().unwrap();
            match ctx.ca_mut(&handle) {
                Ok(ca) => {
                    ca.delete_shadow(&parent, &class_name, &mut publisher)
                }
                Err(e) => Err(e),
            }
        };
        match deleted {
            Ok(keys) => {
                for key in keys {
                    let revoke_parent = parent.clone();
                    let reply =
                        reactor.reply(move |_ctx, _reactor, res| {
                            if let Err(e) = res {
                                warn!(
                                    "could not revoke key {key} at parent \
                                     '{revoke_parent}': {e}"
                                );
                            }
                        });
                    updown.revoke_key(&handle, &parent, key, reply);
                }
            }
            Err(e) => {
                warn!(
                    "could not delete resource class '{class_name}' under \
                     parent '{parent}', skipping: {e}"
                );
            }
        }
    }
    parents_iter.resume(ctx, reactor);
}
