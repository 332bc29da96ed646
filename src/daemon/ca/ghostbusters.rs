//! Ghostbuster records issued by a CA.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use rpki::ca::idexchange::ParentHandle;
use rpki::crypto::KeyIdentifier;
use rpki::repository::x509::Time;
use rpki::uri;
use serde::{Deserialize, Serialize};

use crate::commons::api::{
    Base64, GhostbusterRequest, ObjectName, Revocation,
};
use crate::commons::error::Error;
use crate::commons::CoralResult;
use crate::daemon::signing::{ManifestEntry, ObjectSigner};

use super::{CertAuth, PublicationQueue};

//------------ GhostbusterObject ---------------------------------------------

/// An issued Ghostbuster record: a contact vCard published under one CA
/// signing key.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GhostbusterObject {
    id: u64,
    ca_key: KeyIdentifier,
    vcard: String,
    ee_key: KeyIdentifier,
    uri: uri::Rsync,
    content: Base64,
    valid_until: Time,
}

impl GhostbusterObject {
    pub fn vcard(&self) -> &str {
        &self.vcard
    }

    pub fn ca_key(&self) -> &KeyIdentifier {
        &self.ca_key
    }
}

//------------ Ghostbusters --------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Ghostbusters {
    objects: Vec<GhostbusterObject>,
}

impl Ghostbusters {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GhostbusterObject> {
        self.objects.iter()
    }

    fn remove(&mut self, id: u64) -> Option<GhostbusterObject> {
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

/// # Reconciling Ghostbuster records against the desired set
impl CertAuth {
    /// Matches desired Ghostbuster records against the issued ones: new
    /// (issuing key, vCard) pairs are created, unmatched or no longer
    /// active objects are revoked. Returns the signing keys touched.
    pub fn reconcile_ghostbusters(
        &mut self,
        requests: Vec<GhostbusterRequest>,
        signer: &dyn ObjectSigner,
        publisher: &mut PublicationQueue,
    ) -> CoralResult<Vec<KeyIdentifier>> {
        let mut touched: Vec<KeyIdentifier> = Vec::new();
        let mut orphans: Vec<u64> = Vec::new();
        let mut existing: HashMap<(KeyIdentifier, String), u64> =
            HashMap::new();

        let statuses: Vec<(u64, KeyIdentifier, String, bool)> = self
            .ghostbusters
            .objects
            .iter()
            .map(|o| {
                let active = self
                    .detail(&o.ca_key)
                    .map(|d| d.is_active())
                    .unwrap_or(false);
                (o.id, o.ca_key, o.vcard.clone(), active)
            })
            .collect();
        for (id, key, vcard, active) in statuses {
            let slot = (key, vcard);
            if !active || existing.contains_key(&slot) {
                orphans.push(id);
            } else {
                existing.insert(slot, id);
            }
        }

        let mut seen: HashSet<(ParentHandle, String)> = HashSet::new();
        for request in requests {
            if !self.parents.contains_key(&request.parent) {
                warn!(
                    "unknown parent '{}' in Ghostbuster request, skipping",
                    request.parent
                );
                continue;
            }
            if !seen
                .insert((request.parent.clone(), request.vcard.clone()))
            {
                warn!(
                    "skipping duplicate Ghostbuster request for parent '{}'",
                    request.parent
                );
                continue;
            }

            let active_keys: Vec<KeyIdentifier> = self
                .shadow_class_names(&request.parent)
                .into_iter()
                .filter_map(|class_name| {
                    self.parents
                        .get(&request.parent)
                        .and_then(|p| p.classes.get(&class_name))
                        .and_then(|shadow| shadow.active_detail())
                        .map(|detail| *detail.key())
                })
                .collect();

            for key in active_keys {
                if existing
                    .remove(&(key, request.vcard.clone()))
                    .is_some()
                {
                    debug!(
                        "found existing Ghostbuster record for parent '{}'",
                        request.parent
                    );
                    continue;
                }
                let issued = {
                    let detail =
                        self.detail(&key).ok_or(Error::KeyUnknown(key))?;
                    signer.make_ghostbuster(detail, &request.vcard)?
                };
                debug!(
                    "created new Ghostbuster record for parent '{}'",
                    request.parent
                );
                publisher.publish(
                    key,
                    issued.uri.clone(),
                    issued.content.clone(),
                );
                let id = self.next_id();
                self.ghostbusters.objects.push(GhostbusterObject {
                    id,
                    ca_key: key,
                    vcard: request.vcard.clone(),
                    ee_key: issued.key,
                    uri: issued.uri,
                    content: issued.content,
                    valid_until: issued.valid_until,
                });
                self.mark_dirty();
                if !touched.contains(&key) {
                    touched.push(key);
                }
            }
        }

        orphans.extend(existing.into_values());
        for id in orphans {
            if let Some(key) = self.revoke_ghostbuster(id, publisher) {
                if !touched.contains(&key) {
                    touched.push(key);
                }
            }
        }
        Ok(touched)
    }

    fn revoke_ghostbuster(
        &mut self,
        id: u64,
        publisher: &mut PublicationQueue,
    ) -> Option<KeyIdentifier> {
        let object = self.ghostbusters.remove(id)?;
        self.mark_dirty();
        debug!("revoking Ghostbuster record under key {}", object.ca_key);
        publisher.withdraw(object.ca_key, object.uri.clone());
        if let Some(detail) = self.detail_mut(&object.ca_key) {
            detail.revocations.add(Revocation {
                key: object.ee_key,
                expires: object.valid_until,
            });
        }
        Some(object.ca_key)
    }
}
