//! The publication collaborator boundary.

use rpki::ca::idexchange::CaHandle;

use crate::commons::api::{PublishDelta, PublishReply};
use crate::daemon::caserver::CaServer;
use crate::runtime::Reply;

//------------ PublicationClient ---------------------------------------------

/// The repository server the engine publishes to.
pub trait PublicationClient: Send + Sync {
    /// Sends one batched set of publish/withdraw operations.
    ///
    /// The engine treats the batch as fully successful only if the reply
    /// confirms every element with zero per-element errors.
    fn publish(
        &self,
        ca: &CaHandle,
        delta: PublishDelta,
        reply: Reply<CaServer, PublishReply>,
    );
}
