//! Children of a CA and the certificates issued to them.

use std::collections::HashMap;

use chrono::Duration;
use log::debug;
use rpki::ca::idexchange::ChildHandle;
use rpki::crypto::KeyIdentifier;
use rpki::repository::resources::ResourceSet;
use rpki::repository::x509::Time;
use rpki::uri;
use serde::{Deserialize, Serialize};

use crate::commons::api::{Base64, ChildEntitlement, Revocation};
use crate::commons::error::Error;
use crate::commons::CoralResult;
use crate::daemon::signing::ObjectSigner;

use super::{CertAuth, PublicationQueue};

//------------ ChildCert -----------------------------------------------------

/// A certificate issued to a child's key.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChildCert {
    /// The subject key of the issued certificate.
    key: KeyIdentifier,
    /// The CA signing key that issued it.
    ca_key: KeyIdentifier,
    uri: uri::Rsync,
    content: Base64,
    resources: ResourceSet,
    valid_until: Time,
    /// The issuer's signing certificate URI the certificate carries.
    issuer_uri: uri::Rsync,
}

impl ChildCert {
    pub fn key(&self) -> &KeyIdentifier {
        &self.key
    }

    pub fn ca_key(&self) -> &KeyIdentifier {
        &self.ca_key
    }

    pub fn uri(&self) -> &uri::Rsync {
        &self.uri
    }

    pub fn content(&self) -> &Base64 {
        &self.content
    }

    pub fn resources(&self) -> &ResourceSet {
        &self.resources
    }

    pub fn valid_until(&self) -> Time {
        self.valid_until
    }
}

//------------ Child ---------------------------------------------------------

/// A downstream resource holder.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Child {
    handle: ChildHandle,
    certs: HashMap<KeyIdentifier, ChildCert>,
}

impl Child {
    pub fn handle(&self) -> &ChildHandle {
        &self.handle
    }

    pub fn certs(&self) -> impl Iterator<Item = &ChildCert> {
        self.certs.values()
    }

    pub fn has_certs(&self) -> bool {
        !self.certs.is_empty()
    }

    pub(super) fn withdraw_certs_for_keys(
        &mut self,
        keys: &[KeyIdentifier],
        publisher: &mut PublicationQueue,
    ) {
        self.certs.retain(|_, cert| {
            if keys.contains(&cert.ca_key) {
                publisher.withdraw(cert.ca_key, cert.uri.clone());
                false
            } else {
                true
            }
        });
    }
}

/// # Being a parent
impl CertAuth {
    pub fn add_child(&mut self, child: ChildHandle) -> CoralResult<()> {
        if self.children.contains_key(&child) {
            return Err(Error::custom(format!(
                "CA '{}' already has a child named '{}'",
                self.handle(),
                child
            )));
        }
        self.children.insert(
            child.clone(),
            Child {
                handle: child,
                certs: HashMap::new(),
            },
        );
        self.mark_dirty();
        Ok(())
    }

    /// The child handles in deterministic order.
    pub fn child_handles(&self) -> Vec<ChildHandle> {
        let mut children: Vec<_> = self.children.keys().cloned().collect();
        children.sort_by_key(|c| c.to_string());
        children
    }

    pub fn child(&self, child: &ChildHandle) -> CoralResult<&Child> {
        self.children.get(child).ok_or_else(|| {
            Error::CaChildUnknown(self.handle().clone(), child.clone())
        })
    }

    pub fn child_has_certs(&self, child: &ChildHandle) -> bool {
        self.children
            .get(child)
            .map(|c| c.has_certs())
            .unwrap_or(false)
    }

    /// Issues a first certificate for a child's key under the active
    /// signing key covering the requested resources. This is the entry the
    /// up-down "issue" exchange uses.
    pub fn issue_child_cert(
        &mut self,
        child: &ChildHandle,
        key: KeyIdentifier,
        resources: &ResourceSet,
        valid_until: Time,
        signer: &dyn ObjectSigner,
        publisher: &mut PublicationQueue,
        crl_interval: Duration,
    ) -> CoralResult<()> {
        let ca_key = self
            .covering_active_key(resources)
            .ok_or_else(|| Error::NoCoveringCert(format!("{resources}")))?;
        let (issued, issuer_uri) = {
            let detail =
                self.detail(&ca_key).ok_or(Error::KeyUnknown(ca_key))?;
            let issued = signer.issue_child_cert(
                detail,
                child,
                key,
                resources,
                valid_until,
            )?;
            (issued, detail.signing_uri().clone())
        };

        publisher.publish(ca_key, issued.uri.clone(), issued.content.clone());
        let handle = self.handle().clone();
        let record = ChildCert {
            key,
            ca_key,
            uri: issued.uri,
            content: issued.content,
            resources: resources.clone(),
            valid_until: issued.valid_until,
            issuer_uri,
        };
        self.children
            .get_mut(child)
            .ok_or_else(|| Error::CaChildUnknown(handle, child.clone()))?
            .certs
            .insert(key, record);
        self.mark_dirty();
        self.generate_crl_and_manifest(
            &ca_key,
            signer,
            publisher,
            crl_interval,
        )
    }

    /// Diffs one child's issued certificates against the desired resources
    /// and the issuer's own certified resources.
    ///
    /// Policy: an empty intersection revokes and withdraws, never reissues
    /// with empty resources; changed resources, a changed issuer URI or a
    /// reissuance-worthy validity extension reissue; an expired certificate
    /// is deleted and withdrawn.
    pub fn update_child(
        &mut self,
        child: &ChildHandle,
        entitlement: &ChildEntitlement,
        now: Time,
        regen_threshold: Time,
        signer: &dyn ObjectSigner,
        publisher: &mut PublicationQueue,
        crl_interval: Duration,
    ) -> CoralResult<()> {
        let certs: Vec<ChildCert> = self
            .children
            .get(child)
            .ok_or_else(|| {
                Error::CaChildUnknown(self.handle().clone(), child.clone())
            })?
            .certs
            .values()
            .cloned()
            .collect();

        for cert in certs {
            let Some(detail) = self.detail(&cert.ca_key) else {
                continue;
            };
            if !detail.is_active() {
                continue;
            }
            let issuer_resources = detail.resources().clone();
            let issuer_uri = detail.signing_uri().clone();

            let new_resources = cert
                .resources
                .intersection(&entitlement.resources)
                .intersection(&issuer_resources);

            if new_resources.is_empty() {
                debug!(
                    "resources shrank to the null set, revoking and \
                     withdrawing certificate {} of child '{}'",
                    cert.key, child
                );
                self.revoke_child_cert(child, &cert, publisher)?;
                self.generate_crl_and_manifest(
                    &cert.ca_key,
                    signer,
                    publisher,
                    crl_interval,
                )?;
            } else if new_resources != cert.resources
                || cert.issuer_uri != issuer_uri
                || (cert.valid_until < regen_threshold
                    && entitlement.valid_until > now
                    && cert.valid_until != entitlement.valid_until)
            {
                if new_resources != cert.resources {
                    debug!(
                        "child '{}' key {} resources changed: old {} new {}",
                        child, cert.key, cert.resources, new_resources
                    );
                }
                if cert.valid_until != entitlement.valid_until {
                    debug!(
                        "child '{}' key {} validity changed: old {} new {}",
                        child,
                        cert.key,
                        cert.valid_until.to_rfc3339(),
                        entitlement.valid_until.to_rfc3339()
                    );
                }
                let issued = {
                    let detail = self
                        .detail(&cert.ca_key)
                        .ok_or(Error::KeyUnknown(cert.ca_key))?;
                    signer.issue_child_cert(
                        detail,
                        child,
                        cert.key,
                        &new_resources,
                        entitlement.valid_until,
                    )?
                };
                if issued.uri != cert.uri {
                    publisher.withdraw(cert.ca_key, cert.uri.clone());
                }
                publisher.publish(
                    cert.ca_key,
                    issued.uri.clone(),
                    issued.content.clone(),
                );
                if let Some(stored) = self
                    .children
                    .get_mut(child)
                    .and_then(|c| c.certs.get_mut(&cert.key))
                {
                    stored.resources = new_resources;
                    stored.valid_until = issued.valid_until;
                    stored.uri = issued.uri;
                    stored.content = issued.content;
                    stored.issuer_uri = issuer_uri;
                }
                self.mark_dirty();
                self.generate_crl_and_manifest(
                    &cert.ca_key,
                    signer,
                    publisher,
                    crl_interval,
                )?;
            } else if cert.valid_until < now {
                debug!(
                    "certificate {} of child '{}' has expired, deleting \
                     and withdrawing it",
                    cert.key, child
                );
                if let Some(c) = self.children.get_mut(child) {
                    c.certs.remove(&cert.key);
                }
                publisher.withdraw(cert.ca_key, cert.uri.clone());
                self.mark_dirty();
                self.generate_crl_and_manifest(
                    &cert.ca_key,
                    signer,
                    publisher,
                    crl_interval,
                )?;
            }
        }
        Ok(())
    }

    fn revoke_child_cert(
        &mut self,
        child: &ChildHandle,
        cert: &ChildCert,
        publisher: &mut PublicationQueue,
    ) -> CoralResult<()> {
        if let Some(detail) = self.detail_mut(&cert.ca_key) {
            detail.revocations.add(Revocation {
                key: cert.key,
                expires: cert.valid_until,
            });
        }
        publisher.withdraw(cert.ca_key, cert.uri.clone());
        if let Some(c) = self.children.get_mut(child) {
            c.certs.remove(&cert.key);
        }
        self.mark_dirty();
        Ok(())
    }
}
