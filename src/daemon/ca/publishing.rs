//! The publication queue: one task run's batched publish/withdraw set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use rpki::ca::idexchange::CaHandle;
use rpki::crypto::KeyIdentifier;
use rpki::uri;

use crate::commons::api::{
    Base64, DeltaElement, PublishDelta, PublishElement, PublishReply,
    WithdrawElement,
};
use crate::commons::error::Error;
use crate::daemon::caserver::CaServer;
use crate::daemon::scheduler::Cont;
use crate::runtime::Reactor;

//------------ QueuedOp ------------------------------------------------------

#[derive(Clone, Debug)]
struct QueuedOp {
    /// The signing key whose object set the element belongs to.
    ca_key: KeyIdentifier,
    element: DeltaElement,
}

//------------ PublicationQueue ----------------------------------------------

/// Accumulates publish/withdraw operations for one task run.
///
/// Operations are keyed by URI, because that is the unique key identifying
/// objects in the publication protocol: a later operation on a URI replaces
/// an earlier one, netting out redundant exchanges. The whole set is flushed
/// as one atomic batch.
#[derive(Clone, Debug, Default)]
pub struct PublicationQueue {
    ops: HashMap<uri::Rsync, QueuedOp>,
    /// First-queued order of the URIs, for a deterministic batch.
    order: Vec<uri::Rsync>,
}

impl PublicationQueue {
    pub fn publish(
        &mut self,
        ca_key: KeyIdentifier,
        uri: uri::Rsync,
        content: Base64,
    ) {
        self.queue(
            ca_key,
            DeltaElement::Publish(PublishElement {
                uri,
                base64: content,
            }),
        );
    }

    pub fn withdraw(&mut self, ca_key: KeyIdentifier, uri: uri::Rsync) {
        self.queue(
            ca_key,
            DeltaElement::Withdraw(WithdrawElement { uri }),
        );
    }

    /// Queues a previously built element again, e.g. for a retry of an
    /// unconfirmed exchange.
    pub fn requeue(&mut self, ca_key: KeyIdentifier, element: DeltaElement) {
        self.queue(ca_key, element);
    }

    fn queue(&mut self, ca_key: KeyIdentifier, element: DeltaElement) {
        let uri = element.uri().clone();
        if self
            .ops
            .insert(uri.clone(), QueuedOp { ca_key, element })
            .is_none()
        {
            self.order.push(uri);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    fn drain(&mut self) -> Vec<QueuedOp> {
        let mut ops = Vec::with_capacity(self.ops.len());
        for uri in self.order.drain(..) {
            if let Some(op) = self.ops.remove(&uri) {
                ops.push(op);
            }
        }
        self.ops.clear();
        ops
    }
}

//------------ call_pubd -----------------------------------------------------

/// A continuation receiving the error that failed a task step.
pub type FailedFn =
    Box<dyn FnOnce(&mut CaServer, &mut Reactor<CaServer>, Error) + Send>;

/// Flushes the queued operations to the publication server as one batch.
///
/// On a fully confirmed reply the elements are cleared from the CA's
/// unconfirmed bookkeeping and `done` runs; anything else runs `failed`.
/// An empty queue short-circuits straight to `done`.
pub fn call_pubd(
    queue: &Arc<Mutex<PublicationQueue>>,
    ca: CaHandle,
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
    done: Cont,
    failed: FailedFn,
) {
    let ops = queue.lock().unwrap().drain();
    if ops.is_empty() {
        debug!("nothing to publish for CA '{ca}'");
        done(ctx, reactor);
        return;
    }

    let mut delta = PublishDelta::default();
    let mut sent: Vec<(KeyIdentifier, uri::Rsync)> = Vec::new();
    if let Ok(ca_state) = ctx.ca_mut(&ca) {
        for op in &ops {
            ca_state.record_unconfirmed(op.ca_key, op.element.clone());
        }
    }
    for op in ops {
        sent.push((op.ca_key, op.element.uri().clone()));
        delta.push(op.element);
    }

    let expected = delta.len();
    info!(
        "sending {expected} publication elements for CA '{ca}'"
    );

    let repo = ctx.repo();
    let reply_ca = ca.clone();
    let reply = reactor.reply(
        move |ctx: &mut CaServer,
              reactor: &mut Reactor<CaServer>,
              res: Result<PublishReply, Error>| {
            let ca = reply_ca;
            match res {
                Ok(reply) if reply.confirms_all(expected) => {
                    if let Ok(ca_state) = ctx.ca_mut(&ca) {
                        for (key, uri) in sent {
                            ca_state.confirm_published(&key, &uri);
                        }
                    }
                    done(ctx, reactor)
                }
                Ok(reply) => failed(
                    ctx,
                    reactor,
                    Error::publication(format!(
                        "server confirmed {} of {} elements with {} errors",
                        reply.confirmed.len(),
                        expected,
                        reply.errors.len()
                    )),
                ),
                Err(e) => failed(ctx, reactor, e),
            }
        },
    );
    repo.publish(&ca, delta, reply);
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn key(n: u64) -> KeyIdentifier {
        KeyIdentifier::from_str(&format!("{n:040x}")).unwrap()
    }

    fn object_uri(name: &str) -> uri::Rsync {
        uri::Rsync::from_string(format!(
            "rsync://repo.example.org/repo/ca/{name}"
        ))
        .unwrap()
    }

    #[test]
    fn later_ops_replace_earlier_ones() {
        let mut queue = PublicationQueue::default();
        let uri = object_uri("1.roa");

        queue.publish(key(1), uri.clone(), Base64::from_content(b"one"));
        queue.publish(key(1), uri.clone(), Base64::from_content(b"two"));
        assert_eq!(queue.len(), 1);

        queue.withdraw(key(1), uri.clone());
        assert_eq!(queue.len(), 1);

        let ops = queue.drain();
        assert!(matches!(ops[0].element, DeltaElement::Withdraw(_)));
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_keeps_first_queued_order() {
        let mut queue = PublicationQueue::default();
        let crl = object_uri("ta.crl");
        let mft = object_uri("ta.mft");
        let roa = object_uri("1.roa");

        queue.publish(key(1), roa.clone(), Base64::from_content(b"roa"));
        queue.publish(key(1), crl.clone(), Base64::from_content(b"crl"));
        queue.publish(key(1), mft.clone(), Base64::from_content(b"mft"));
        // replacing does not reorder
        queue.publish(key(1), crl.clone(), Base64::from_content(b"crl2"));

        let uris: Vec<uri::Rsync> = queue
            .drain()
            .into_iter()
            .map(|op| op.element.uri().clone())
            .collect();
        assert_eq!(uris, vec![roa, crl, mft]);
    }
}
