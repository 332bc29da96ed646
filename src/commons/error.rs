//! Defines all coral engine errors.

use std::fmt;

use rpki::ca::idexchange::{CaHandle, ChildHandle, ParentHandle};
use rpki::ca::provisioning::ResourceClassName;
use rpki::crypto::KeyIdentifier;

//------------ Error ---------------------------------------------------------

#[derive(Clone, Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // CA issues
    //-----------------------------------------------------------------
    CaUnknown(CaHandle),

    CaDuplicate(CaHandle),

    CaParentUnknown(CaHandle, ParentHandle),

    CaChildUnknown(CaHandle, ChildHandle),

    ResourceClassUnknown(CaHandle, ResourceClassName),

    KeyUnknown(KeyIdentifier),

    /// No currently active signing key covers the requested resources.
    NoCoveringCert(String),

    //-----------------------------------------------------------------
    // Collaborator issues
    //-----------------------------------------------------------------
    IrdbError(String),

    UpDownError(String),

    PublicationError(String),

    SignerError(String),

    //-----------------------------------------------------------------
    // Runtime issues
    //-----------------------------------------------------------------
    /// The event loop went away before the operation completed.
    ReactorGone,

    Custom(String),
}

impl Error {
    pub fn custom(msg: impl fmt::Display) -> Self {
        Error::Custom(msg.to_string())
    }

    pub fn signer(e: impl fmt::Display) -> Self {
        Error::SignerError(e.to_string())
    }

    pub fn publication(e: impl fmt::Display) -> Self {
        Error::PublicationError(e.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::CaUnknown(ca) => write!(f, "CA '{ca}' is unknown"),
            Error::CaDuplicate(ca) => {
                write!(f, "CA '{ca}' was already added")
            }
            Error::CaParentUnknown(ca, parent) => {
                write!(f, "CA '{ca}' does not have a parent named '{parent}'")
            }
            Error::CaChildUnknown(ca, child) => {
                write!(f, "CA '{ca}' does not have a child named '{child}'")
            }
            Error::ResourceClassUnknown(ca, rcn) => {
                write!(f, "CA '{ca}' has no resource class '{rcn}'")
            }
            Error::KeyUnknown(ki) => {
                write!(f, "no CA signing key with identifier '{ki}'")
            }
            Error::NoCoveringCert(what) => {
                write!(f, "no active signing key covers {what}")
            }
            Error::IrdbError(e) => write!(f, "IRDB error: {e}"),
            Error::UpDownError(e) => write!(f, "up-down error: {e}"),
            Error::PublicationError(e) => write!(f, "publication error: {e}"),
            Error::SignerError(e) => write!(f, "signing issue: {e}"),
            Error::ReactorGone => {
                write!(f, "event loop terminated before the reply arrived")
            }
            Error::Custom(msg) => msg.fmt(f),
        }
    }
}

impl std::error::Error for Error {}
