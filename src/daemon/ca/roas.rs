//! Route origin attestations issued by a CA.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use rpki::crypto::KeyIdentifier;
use rpki::repository::x509::Time;
use rpki::uri;
use serde::{Deserialize, Serialize};

use crate::commons::api::{Base64, ObjectName, Revocation, RoaPayload};
use crate::commons::error::Error;
use crate::commons::CoralResult;
use crate::daemon::signing::{ManifestEntry, ObjectSigner};

use super::{CertAuth, PublicationQueue};

//------------ RoaInfo -------------------------------------------------------

/// The issued object backing a ROA.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoaInfo {
    ca_key: KeyIdentifier,
    /// The key of the one-off EE certificate inside the ROA, revoked when
    /// the object is replaced or withdrawn.
    ee_key: KeyIdentifier,
    uri: uri::Rsync,
    content: Base64,
    valid_until: Time,
}

//------------ RoaObject -----------------------------------------------------

/// A route origin attestation, possibly not (yet) backed by a signed
/// object.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoaObject {
    id: u64,
    payload: RoaPayload,
    issued: Option<RoaInfo>,
}

impl RoaObject {
    pub fn payload(&self) -> &RoaPayload {
        &self.payload
    }

    pub fn is_issued(&self) -> bool {
        self.issued.is_some()
    }

    pub fn uri(&self) -> Option<&uri::Rsync> {
        self.issued.as_ref().map(|i| &i.uri)
    }
}

//------------ Roas ----------------------------------------------------------

/// The ROAs held by a CA.
///
/// Deliberately a list rather than a map: duplicates for the same payload
/// can exist transiently, e.g. left behind by a key replacement, and are
/// resolved by the reconciliation run.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Roas {
    objects: Vec<RoaObject>,
}

impl Roas {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoaObject> {
        self.objects.iter()
    }

    pub fn find(&self, payload: &RoaPayload) -> Option<&RoaObject> {
        self.objects.iter().find(|o| o.payload == *payload)
    }

    fn get(&self, id: u64) -> Option<&RoaObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut RoaObject> {
        self.objects.iter_mut().find(|o| o.id == id)
    }

    fn remove(&mut self, id: u64) -> Option<RoaObject> {
        let index = self.objects.iter().position(|o| o.id == id)?;
        Some(self.objects.remove(index))
    }

    pub(super) fn manifest_entries(
        &self,
        key: &KeyIdentifier,
    ) -> Vec<ManifestEntry> {
        self.objects
            .iter()
            .filter_map(|o| o.issued.as_ref())
            .filter(|i| i.ca_key == *key)
            .map(|i| ManifestEntry {
                name: ObjectName::from_uri(&i.uri),
                content: i.content.clone(),
            })
            .collect()
    }

    pub(super) fn withdraw_for_keys(
        &mut self,
        keys: &[KeyIdentifier],
        publisher: &mut PublicationQueue,
    ) {
        self.objects.retain(|o| match &o.issued {
            Some(info) if keys.contains(&info.ca_key) => {
                publisher.withdraw(info.ca_key, info.uri.clone());
                false
            }
            _ => true,
        });
    }
}

/// # Reconciling ROAs against the desired set
impl CertAuth {
    /// Matches the desired ROA set against the issued one.
    ///
    /// Returns the object ids to bring up to date (existing matches plus
    /// freshly created shells for new requests) and the ids orphaned by the
    /// diff. When duplicate objects collide on a payload, one issued by a
    /// currently active signing key is preferred over one that is not.
    pub fn prepare_roa_updates(
        &mut self,
        requests: Vec<RoaPayload>,
    ) -> (Vec<u64>, Vec<u64>) {
        let mut by_payload: HashMap<RoaPayload, (u64, bool)> =
            HashMap::new();
        let mut orphans: Vec<u64> = Vec::new();

        let statuses: Vec<(u64, RoaPayload, bool)> = self
            .roas
            .objects
            .iter()
            .map(|o| {
                let usable = o
                    .issued
                    .as_ref()
                    .and_then(|i| self.detail(&i.ca_key))
                    .map(|d| d.is_active())
                    .unwrap_or(false);
                (o.id, o.payload.clone(), usable)
            })
            .collect();

        for (id, payload, usable) in statuses {
            match by_payload.entry(payload) {
                Entry::Vacant(entry) => {
                    entry.insert((id, usable));
                }
                Entry::Occupied(mut entry) => {
                    let (kept_id, kept_usable) = entry.get_mut();
                    if usable && !*kept_usable {
                        orphans.push(*kept_id);
                        *kept_id = id;
                        *kept_usable = usable;
                    } else {
                        orphans.push(id);
                    }
                }
            }
        }

        let mut updates = Vec::new();
        let mut seen: HashSet<RoaPayload> = HashSet::new();
        for request in requests {
            if !seen.insert(request.clone()) {
                warn!("skipping duplicate ROA request {request}");
                continue;
            }
            match by_payload.remove(&request) {
                Some((id, _)) => {
                    debug!("found existing ROA for {request}");
                    updates.push(id);
                }
                None => {
                    let id = self.next_id();
                    debug!("created new ROA object for {request}");
                    self.roas.objects.push(RoaObject {
                        id,
                        payload: request,
                        issued: None,
                    });
                    self.mark_dirty();
                    updates.push(id);
                }
            }
        }

        orphans.extend(by_payload.into_values().map(|(id, _)| id));
        (updates, orphans)
    }

    /// Makes sure the ROA is backed by an object issued by an active
    /// covering key, replacing a stale object if needed.
    ///
    /// Returns the signing key touched, or `None` if the object was already
    /// up to date.
    pub fn update_roa(
        &mut self,
        id: u64,
        signer: &dyn ObjectSigner,
        publisher: &mut PublicationQueue,
    ) -> CoralResult<Option<KeyIdentifier>> {
        let (payload, current) = {
            let object = self
                .roas
                .get(id)
                .ok_or_else(|| Error::custom("unknown ROA object"))?;
            (object.payload.clone(), object.issued.clone())
        };

        if let Some(info) = &current {
            if self
                .detail(&info.ca_key)
                .map(|d| d.is_active())
                .unwrap_or(false)
            {
                return Ok(None);
            }
        }

        let resources = payload.resources()?;
        let ca_key = self
            .covering_active_key(&resources)
            .ok_or_else(|| Error::NoCoveringCert(payload.to_string()))?;
        let issued = {
            let detail =
                self.detail(&ca_key).ok_or(Error::KeyUnknown(ca_key))?;
            signer.make_roa(detail, &payload)?
        };

        if let Some(old) = current {
            publisher.withdraw(old.ca_key, old.uri.clone());
            if let Some(detail) = self.detail_mut(&old.ca_key) {
                detail.revocations.add(Revocation {
                    key: old.ee_key,
                    expires: old.valid_until,
                });
            }
        }

        publisher.publish(ca_key, issued.uri.clone(), issued.content.clone());
        if let Some(object) = self.roas.get_mut(id) {
            object.issued = Some(RoaInfo {
                ca_key,
                ee_key: issued.key,
                uri: issued.uri,
                content: issued.content,
                valid_until: issued.valid_until,
            });
        }
        self.mark_dirty();
        Ok(Some(ca_key))
    }

    /// Withdraws and revokes an orphaned ROA and deletes its bookkeeping.
    ///
    /// Returns the signing key touched, if the orphan was backed by an
    /// object.
    pub fn revoke_roa(
        &mut self,
        id: u64,
        publisher: &mut PublicationQueue,
    ) -> Option<KeyIdentifier> {
        let object = self.roas.remove(id)?;
        self.mark_dirty();
        let info = object.issued?;
        debug!("revoking ROA {}", object.payload);
        publisher.withdraw(info.ca_key, info.uri.clone());
        if let Some(detail) = self.detail_mut(&info.ca_key) {
            detail.revocations.add(Revocation {
                key: info.ee_key,
                expires: info.valid_until,
            });
        }
        Some(info.ca_key)
    }
}
