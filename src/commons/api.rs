//! Data types shared between the engine and its collaborators.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::engine::Engine as _;
use bytes::Bytes;
use rpki::ca::idexchange::ParentHandle;
use rpki::ca::provisioning::ResourceClassName;
use rpki::crypto::KeyIdentifier;
use rpki::repository::resources::ResourceSet;
use rpki::repository::x509::Time;
use rpki::uri;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::commons::error::Error;
use crate::commons::CoralResult;

//------------ Base64 --------------------------------------------------------

/// The supported way to transport opaque object content: the base64 encoded
/// DER bytes of a signed object. The engine never looks inside.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Base64(Bytes);

impl Base64 {
    pub fn from_content(content: &[u8]) -> Self {
        Base64(Bytes::copy_from_slice(content))
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn size(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Base64 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        BASE64_ENGINE.encode(&self.0).fmt(f)
    }
}

impl FromStr for Base64 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dec = BASE64_ENGINE
            .decode(s)
            .map_err(|e| Error::custom(format!("invalid base64: {e}")))?;
        Ok(Base64(Bytes::from(dec)))
    }
}

impl Serialize for Base64 {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(s)
    }
}

impl<'de> Deserialize<'de> for Base64 {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let string = String::deserialize(d)?;
        Base64::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ ObjectName ----------------------------------------------------

/// The file name of a published object, i.e. the last segment of its
/// publication URI. Used for manifest entries.
#[derive(
    Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct ObjectName(String);

impl ObjectName {
    pub fn from_uri(uri: &uri::Rsync) -> Self {
        let full = uri.to_string();
        let name = full.rsplit('/').next().unwrap_or_default();
        ObjectName(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjectName {
    fn from(s: &str) -> Self {
        ObjectName(s.to_string())
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

//------------ AsNumber ------------------------------------------------------

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct AsNumber(u32);

impl AsNumber {
    pub const fn from_u32(number: u32) -> Self {
        AsNumber(number)
    }
}

impl FromStr for AsNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let number = u32::from_str(s)
            .map_err(|_| Error::custom(format!("invalid AS number: {s}")))?;
        Ok(AsNumber(number))
    }
}

impl fmt::Display for AsNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//------------ RoaPayload ----------------------------------------------------

/// The key identifying a route origin attestation: the origin AS plus the
/// canonical IPv4 and IPv6 prefix list strings it authorizes. Desired state
/// and issued objects are matched on this key.
#[derive(
    Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct RoaPayload {
    pub asn: AsNumber,
    pub v4: String,
    pub v6: String,
}

impl RoaPayload {
    pub fn new(asn: AsNumber, v4: &str, v6: &str) -> Self {
        RoaPayload {
            asn,
            v4: v4.trim().to_string(),
            v6: v6.trim().to_string(),
        }
    }

    /// The address resources this payload needs to be covered by.
    pub fn resources(&self) -> CoralResult<ResourceSet> {
        ResourceSet::from_strs("", &self.v4, &self.v6)
            .map_err(|e| Error::custom(format!("invalid ROA prefixes: {e}")))
    }
}

impl fmt::Display for RoaPayload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AS{} v4 '{}' v6 '{}'", self.asn, self.v4, self.v6)
    }
}

//------------ Desired state requests ----------------------------------------

/// A Ghostbuster record request: publish the given contact vCard under the
/// CAs held from the given parent.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct GhostbusterRequest {
    pub parent: ParentHandle,
    pub vcard: String,
}

/// An end entity certificate request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EeCertRequest {
    /// The key identifier of the requested certificate. Requests and issued
    /// certificates are matched on this.
    pub key: KeyIdentifier,
    pub subject: String,
    pub resources: ResourceSet,
    pub valid_until: Time,
}

/// The authoritative resources for one child, as the IRDB wants them.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChildEntitlement {
    pub resources: ResourceSet,
    pub valid_until: Time,
}

/// One resource class in a parent's list response.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClassEntitlement {
    pub class_name: ResourceClassName,
    pub resources: ResourceSet,
    /// Base rsync URI under which objects for this class are published.
    pub base_uri: uri::Rsync,
    pub valid_until: Time,
}

//------------ Revocation ----------------------------------------------------

/// A revoked object under a CA signing key, retained on the CRL until it
/// would have expired anyway.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Revocation {
    pub key: KeyIdentifier,
    pub expires: Time,
}

/// The revocations tracked for a CA signing key.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Revocations(Vec<Revocation>);

impl Revocations {
    pub fn add(&mut self, revocation: Revocation) {
        self.0.push(revocation);
    }

    /// Drops all expired revocations and returns them.
    pub fn purge(&mut self, now: Time) -> Vec<Revocation> {
        let (expired, current) =
            self.0.drain(..).partition(|r| r.expires < now);
        self.0 = current;
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &Revocation> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

//------------ Publication protocol ------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PublishElement {
    pub uri: uri::Rsync,
    pub base64: Base64,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WithdrawElement {
    pub uri: uri::Rsync,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeltaElement {
    Publish(PublishElement),
    Withdraw(WithdrawElement),
}

impl DeltaElement {
    pub fn uri(&self) -> &uri::Rsync {
        match self {
            DeltaElement::Publish(p) => &p.uri,
            DeltaElement::Withdraw(w) => &w.uri,
        }
    }
}

impl fmt::Display for DeltaElement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeltaElement::Publish(p) => write!(f, "publish {}", p.uri),
            DeltaElement::Withdraw(w) => write!(f, "withdraw {}", w.uri),
        }
    }
}

/// One batched set of publish and withdraw operations for the repository.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PublishDelta {
    elements: Vec<DeltaElement>,
}

impl PublishDelta {
    pub fn push(&mut self, element: DeltaElement) {
        self.elements.push(element);
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[DeltaElement] {
        &self.elements
    }

    pub fn into_elements(self) -> Vec<DeltaElement> {
        self.elements
    }
}

/// The per-element outcome of a publication exchange.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PublishReply {
    pub confirmed: Vec<uri::Rsync>,
    pub errors: Vec<PublishReplyError>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PublishReplyError {
    pub uri: uri::Rsync,
    pub error: String,
}

impl PublishReply {
    /// Whether the batch as a whole succeeded: every element confirmed and
    /// no per-element errors.
    pub fn confirms_all(&self, sent: usize) -> bool {
        self.errors.is_empty() && self.confirmed.len() == sent
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip() {
        let b = Base64::from_content(b"hello object");
        let s = b.to_string();
        let back = Base64::from_str(&s).unwrap();
        assert_eq!(b, back);

        let json = serde_json::to_string(&b).unwrap();
        let de: Base64 = serde_json::from_str(&json).unwrap();
        assert_eq!(b, de);
    }

    #[test]
    fn object_name_from_uri() {
        let uri =
            uri::Rsync::from_str("rsync://repo.example.org/repo/ca/1.roa")
                .unwrap();
        assert_eq!(ObjectName::from_uri(&uri).as_str(), "1.roa");
    }

    #[test]
    fn revocations_purge() {
        let mut revocations = Revocations::default();
        let now = Time::now();
        let key = KeyIdentifier::from_str(
            "0123456789abcdef0123456789abcdef01234567",
        )
        .unwrap();
        revocations.add(Revocation {
            key,
            expires: now + chrono::Duration::hours(1),
        });
        revocations.add(Revocation {
            key,
            expires: now - chrono::Duration::hours(1),
        });

        let expired = revocations.purge(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(revocations.len(), 1);
    }
}
