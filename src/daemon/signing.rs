//! The certificate/CMS collaborator boundary.
//!
//! Tasks never manipulate certificate encodings directly: everything signed
//! is produced by an [`ObjectSigner`] and handled as an opaque
//! [`IssuedObject`] afterwards.

use rpki::ca::idexchange::ChildHandle;
use rpki::crypto::KeyIdentifier;
use rpki::repository::resources::ResourceSet;
use rpki::repository::x509::Time;
use rpki::uri;

use crate::commons::api::{
    Base64, EeCertRequest, ObjectName, Revocation, RoaPayload,
};
use crate::commons::CoralResult;
use crate::daemon::ca::CaDetail;

//------------ IssuedObject --------------------------------------------------

/// One freshly signed object: where it publishes, its content, the subject
/// key of the certificate inside it and how long it is good for.
#[derive(Clone, Debug)]
pub struct IssuedObject {
    pub uri: uri::Rsync,
    pub content: Base64,
    pub key: KeyIdentifier,
    pub valid_until: Time,
}

//------------ ManifestEntry -------------------------------------------------

/// A published object to be listed (by name and hash of content) on a
/// manifest.
#[derive(Clone, Debug)]
pub struct ManifestEntry {
    pub name: ObjectName,
    pub content: Base64,
}

//------------ ObjectSigner --------------------------------------------------

/// The opaque signing operations the engine needs.
pub trait ObjectSigner: Send + Sync {
    /// Creates a new CA signing key.
    fn create_key(&self) -> CoralResult<KeyIdentifier>;

    /// Issues or reissues a certificate for a child's key.
    fn issue_child_cert(
        &self,
        issuer: &CaDetail,
        child: &ChildHandle,
        key: KeyIdentifier,
        resources: &ResourceSet,
        valid_until: Time,
    ) -> CoralResult<IssuedObject>;

    /// Produces a ROA for the given payload, signed under a fresh EE
    /// certificate of the issuing key.
    fn make_roa(
        &self,
        issuer: &CaDetail,
        payload: &RoaPayload,
    ) -> CoralResult<IssuedObject>;

    /// Produces a Ghostbuster record holding the given vCard.
    fn make_ghostbuster(
        &self,
        issuer: &CaDetail,
        vcard: &str,
    ) -> CoralResult<IssuedObject>;

    /// Produces an end entity certificate for the given request.
    fn make_ee_certificate(
        &self,
        issuer: &CaDetail,
        request: &EeCertRequest,
    ) -> CoralResult<IssuedObject>;

    /// Produces a new CRL for the issuing key.
    fn make_crl(
        &self,
        issuer: &CaDetail,
        revocations: &[Revocation],
        number: u64,
        next_update: Time,
    ) -> CoralResult<IssuedObject>;

    /// Produces a new manifest listing the given entries.
    fn make_manifest(
        &self,
        issuer: &CaDetail,
        entries: &[ManifestEntry],
        number: u64,
        next_update: Time,
    ) -> CoralResult<IssuedObject>;
}
