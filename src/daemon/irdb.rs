//! The IRDB collaborator boundary: the "desired state" oracle every
//! reconciliation task diffs against.

use rpki::ca::idexchange::{CaHandle, ChildHandle, ParentHandle};

use crate::commons::api::{
    ChildEntitlement, EeCertRequest, GhostbusterRequest, RoaPayload,
};
use crate::daemon::caserver::CaServer;
use crate::runtime::Reply;

//------------ IrdbClient ----------------------------------------------------

/// Request/response exchange with the IRDB, keyed by CA handle.
///
/// Implementations may answer from another thread or inline; the reply
/// always re-enters the event loop.
pub trait IrdbClient: Send + Sync {
    /// The authoritative resources for one child of the CA.
    fn child_resources(
        &self,
        ca: &CaHandle,
        child: &ChildHandle,
        reply: Reply<CaServer, ChildEntitlement>,
    );

    /// The desired set of ROAs for the CA.
    fn roa_requests(
        &self,
        ca: &CaHandle,
        reply: Reply<CaServer, Vec<RoaPayload>>,
    );

    /// The desired set of Ghostbuster records for the CA, restricted to the
    /// given parents.
    fn ghostbuster_requests(
        &self,
        ca: &CaHandle,
        parents: Vec<ParentHandle>,
        reply: Reply<CaServer, Vec<GhostbusterRequest>>,
    );

    /// The desired set of end entity certificates for the CA.
    fn ee_certificate_requests(
        &self,
        ca: &CaHandle,
        reply: Reply<CaServer, Vec<EeCertRequest>>,
    );
}
