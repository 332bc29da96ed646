//! The parent (up-down) collaborator boundary.

use rpki::ca::idexchange::{CaHandle, ParentHandle};
use rpki::crypto::KeyIdentifier;

use crate::commons::api::ClassEntitlement;
use crate::daemon::caserver::CaServer;
use crate::runtime::Reply;

//------------ ProvisioningClient --------------------------------------------

/// The list/revoke exchange with a CA's parents.
pub trait ProvisioningClient: Send + Sync {
    /// Asks the parent for its authoritative list of resource classes and
    /// the entitlements the CA holds in each.
    fn list(
        &self,
        ca: &CaHandle,
        parent: &ParentHandle,
        reply: Reply<CaServer, Vec<ClassEntitlement>>,
    );

    /// Asks the parent to revoke all certificates for the given CA key.
    fn revoke_key(
        &self,
        ca: &CaHandle,
        parent: &ParentHandle,
        key: KeyIdentifier,
        reply: Reply<CaServer, ()>,
    );
}
