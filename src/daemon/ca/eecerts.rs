//! End entity certificates issued by a CA.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};
use rpki::crypto::KeyIdentifier;
use rpki::repository::resources::ResourceSet;
use rpki::repository::x509::Time;
use rpki::uri;
use serde::{Deserialize, Serialize};

use crate::commons::api::{Base64, EeCertRequest, ObjectName, Revocation};
use crate::commons::error::Error;
use crate::commons::CoralResult;
use crate::daemon::signing::{ManifestEntry, ObjectSigner};

use super::{CertAuth, PublicationQueue};

//------------ EeCertObject --------------------------------------------------

/// An issued end entity certificate.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EeCertObject {
    id: u64,
    /// The requested key identifier; requests are matched on this.
    key: KeyIdentifier,
    ca_key: KeyIdentifier,
    uri: uri::Rsync,
    content: Base64,
    resources: ResourceSet,
    valid_until: Time,
}

impl EeCertObject {
    pub fn key(&self) -> &KeyIdentifier {
        &self.key
    }

    pub fn ca_key(&self) -> &KeyIdentifier {
        &self.ca_key
    }
}

//------------ EeCerts -------------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EeCerts {
    objects: Vec<EeCertObject>,
}

impl EeCerts {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EeCertObject> {
        self.objects.iter()
    }

    fn get(&self, id: u64) -> Option<&EeCertObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut EeCertObject> {
        self.objects.iter_mut().find(|o| o.id == id)
    }

    fn remove(&mut self, id: u64) -> Option<EeCertObject> {
        let index = self.objects.iter().position(|o| o.id == id)?;
        Some(self.objects.remove(index))
    }

    pub(super) fn manifest_entries(
        &self,
        key: &KeyIdentifier,
    ) -> Vec<ManifestEntry> {
        self.objects
            .iter()
            .filter(|o| o.ca_key == *key)
            .map(|o| ManifestEntry {
                name: ObjectName::from_uri(&o.uri),
                content: o.content.clone(),
            })
            .collect()
    }

    pub(super) fn withdraw_for_keys(
        &mut self,
        keys: &[KeyIdentifier],
        publisher: &mut PublicationQueue,
    ) {
        self.objects.retain(|o| {
            if keys.contains(&o.ca_key) {
                publisher.withdraw(o.ca_key, o.uri.clone());
                false
            } else {
                true
            }
        });
    }
}

/// # Reconciling EE certificates against the desired set
impl CertAuth {
    /// Matches desired EE certificates against the issued ones.
    ///
    /// A request is issued by exactly one signing key whose active
    /// resources cover it; if none covers it, it is not issued. An
    /// existing certificate whose issuing key no longer covers the request
    /// is revoked. Returns the signing keys touched.
    pub fn reconcile_ee_certs(
        &mut self,
        requests: Vec<EeCertRequest>,
        signer: &dyn ObjectSigner,
        publisher: &mut PublicationQueue,
    ) -> CoralResult<Vec<KeyIdentifier>> {
        let mut touched: Vec<KeyIdentifier> = Vec::new();
        let touch = |touched: &mut Vec<KeyIdentifier>,
                     key: KeyIdentifier| {
            if !touched.contains(&key) {
                touched.push(key);
            }
        };

        let mut existing: HashMap<KeyIdentifier, Vec<u64>> = HashMap::new();
        for object in &self.ee_certs.objects {
            existing.entry(object.key).or_default().push(object.id);
        }

        let mut seen: HashSet<KeyIdentifier> = HashSet::new();
        for request in requests {
            if !seen.insert(request.key) {
                warn!(
                    "skipping duplicate EE certificate request {}",
                    request.key
                );
                continue;
            }
            let ids = existing.remove(&request.key).unwrap_or_default();

            let Some(cover) = self.covering_active_key(&request.resources)
            else {
                info!(
                    "no active signing key covers EE certificate request \
                     {}, not issuing",
                    request.key
                );
                for id in ids {
                    if let Some(key) = self.revoke_ee_cert(id, publisher) {
                        touch(&mut touched, key);
                    }
                }
                continue;
            };

            let mut kept = false;
            for id in ids {
                let matches_cover = self
                    .ee_certs
                    .get(id)
                    .map(|o| o.ca_key == cover)
                    .unwrap_or(false);
                if matches_cover && !kept {
                    kept = true;
                    let needs_reissue = self
                        .ee_certs
                        .get(id)
                        .map(|o| {
                            o.resources != request.resources
                                || o.valid_until != request.valid_until
                        })
                        .unwrap_or(false);
                    if needs_reissue {
                        debug!(
                            "updating existing EE certificate for {}",
                            request.key
                        );
                        self.reissue_ee_cert(
                            id, cover, &request, signer, publisher,
                        )?;
                        touch(&mut touched, cover);
                    }
                } else {
                    debug!(
                        "existing EE certificate for {} is no longer \
                         covered",
                        request.key
                    );
                    if let Some(key) = self.revoke_ee_cert(id, publisher) {
                        touch(&mut touched, key);
                    }
                }
            }

            if !kept {
                debug!("no existing EE certificate for {}", request.key);
                let issued = {
                    let detail = self
                        .detail(&cover)
                        .ok_or(Error::KeyUnknown(cover))?;
                    signer.make_ee_certificate(detail, &request)?
                };
                publisher.publish(
                    cover,
                    issued.uri.clone(),
                    issued.content.clone(),
                );
                let id = self.next_id();
                self.ee_certs.objects.push(EeCertObject {
                    id,
                    key: request.key,
                    ca_key: cover,
                    uri: issued.uri,
                    content: issued.content,
                    resources: request.resources.clone(),
                    valid_until: request.valid_until,
                });
                self.mark_dirty();
                touch(&mut touched, cover);
            }
        }

        // anything left is an orphan
        for ids in existing.into_values() {
            for id in ids {
                if let Some(key) = self.revoke_ee_cert(id, publisher) {
                    touch(&mut touched, key);
                }
            }
        }
        Ok(touched)
    }

    fn reissue_ee_cert(
        &mut self,
        id: u64,
        cover: KeyIdentifier,
        request: &EeCertRequest,
        signer: &dyn ObjectSigner,
        publisher: &mut PublicationQueue,
    ) -> CoralResult<()> {
        let old_uri = self
            .ee_certs
            .get(id)
            .map(|o| o.uri.clone())
            .ok_or_else(|| Error::custom("unknown EE certificate"))?;
        let issued = {
            let detail =
                self.detail(&cover).ok_or(Error::KeyUnknown(cover))?;
            signer.make_ee_certificate(detail, request)?
        };
        if issued.uri != old_uri {
            publisher.withdraw(cover, old_uri);
        }
        publisher.publish(cover, issued.uri.clone(), issued.content.clone());
        if let Some(object) = self.ee_certs.get_mut(id) {
            object.uri = issued.uri;
            object.content = issued.content;
            object.resources = request.resources.clone();
            object.valid_until = request.valid_until;
        }
        self.mark_dirty();
        Ok(())
    }

    fn revoke_ee_cert(
        &mut self,
        id: u64,
        publisher: &mut PublicationQueue,
    ) -> Option<KeyIdentifier> {
        let object = self.ee_certs.remove(id)?;
        self.mark_dirty();
        debug!("revoking EE certificate {}", object.key);
        publisher.withdraw(object.ca_key, object.uri.clone());
        if let Some(detail) = self.detail_mut(&object.ca_key) {
            detail.revocations.add(Revocation {
                key: object.key,
                expires: object.valid_until,
            });
        }
        Some(object.ca_key)
    }
}
