//! The in-memory model of a hosted CA and everything it has issued.

mod child;
mod eecerts;
mod ghostbusters;
mod publishing;
mod roas;

pub use self::child::{Child, ChildCert};
pub use self::eecerts::EeCerts;
pub use self::ghostbusters::Ghostbusters;
pub use self::publishing::{call_pubd, FailedFn, PublicationQueue};
pub use self::roas::Roas;

use std::collections::HashMap;

use chrono::Duration;
use log::{debug, info};
use rpki::ca::idexchange::{CaHandle, ChildHandle, ParentHandle};
use rpki::ca::provisioning::ResourceClassName;
use rpki::crypto::KeyIdentifier;
use rpki::repository::resources::ResourceSet;
use rpki::repository::x509::Time;
use rpki::uri;
use serde::{Deserialize, Serialize};

use crate::commons::api::{
    Base64, ClassEntitlement, DeltaElement, ObjectName, Revocations,
};
use crate::commons::error::Error;
use crate::commons::CoralResult;
use crate::daemon::signing::{IssuedObject, ManifestEntry, ObjectSigner};

//------------ CaDetailState -------------------------------------------------

/// The lifecycle state of one generation of a CA signing key.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CaDetailState {
    Pending,
    Active,
    Deprecated,
    Revoked,
}

//------------ PublishedObject -----------------------------------------------

/// A CRL or manifest as currently published for a signing key.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PublishedObject {
    pub uri: uri::Rsync,
    pub content: Base64,
    pub next_update: Time,
}

//------------ CaDetail ------------------------------------------------------

/// One generation of a CA's signing key plus its latest CRL and manifest.
///
/// Revoked instances are retained as tombstones until their last CRL's
/// nextUpdate has passed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CaDetail {
    key: KeyIdentifier,
    state: CaDetailState,
    resources: ResourceSet,
    /// The directory under which this key's objects are published.
    base_uri: uri::Rsync,
    /// Where the signing certificate for this key lives; subordinate
    /// objects carry this as their issuer URI.
    signing_uri: uri::Rsync,
    valid_until: Time,
    /// CRL and manifest serial, bumped on every regeneration.
    number: u64,
    revocations: Revocations,
    crl: Option<PublishedObject>,
    manifest: Option<PublishedObject>,
    /// Elements sent to the publication server but not yet confirmed.
    unconfirmed: HashMap<uri::Rsync, DeltaElement>,
}

impl CaDetail {
    fn create(
        key: KeyIdentifier,
        entitlement: &ClassEntitlement,
    ) -> CoralResult<Self> {
        let signing_uri =
            object_uri(&entitlement.base_uri, &format!("{key}.cer"))?;
        Ok(CaDetail {
            key,
            state: CaDetailState::Active,
            resources: entitlement.resources.clone(),
            base_uri: entitlement.base_uri.clone(),
            signing_uri,
            valid_until: entitlement.valid_until,
            number: 0,
            revocations: Revocations::default(),
            crl: None,
            manifest: None,
            unconfirmed: HashMap::new(),
        })
    }

    pub fn key(&self) -> &KeyIdentifier {
        &self.key
    }

    pub fn state(&self) -> CaDetailState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == CaDetailState::Active
    }

    pub fn resources(&self) -> &ResourceSet {
        &self.resources
    }

    pub fn base_uri(&self) -> &uri::Rsync {
        &self.base_uri
    }

    pub fn signing_uri(&self) -> &uri::Rsync {
        &self.signing_uri
    }

    pub fn crl(&self) -> Option<&PublishedObject> {
        self.crl.as_ref()
    }

    pub fn manifest(&self) -> Option<&PublishedObject> {
        self.manifest.as_ref()
    }

    /// The publication URI for an object of the given name under this key.
    pub fn object_uri(&self, name: &str) -> CoralResult<uri::Rsync> {
        object_uri(&self.base_uri, name)
    }

    fn withdraw_own_objects(&self, publisher: &mut PublicationQueue) {
        if let Some(crl) = &self.crl {
            publisher.withdraw(self.key, crl.uri.clone());
        }
        if let Some(manifest) = &self.manifest {
            publisher.withdraw(self.key, manifest.uri.clone());
        }
    }
}

fn object_uri(base: &uri::Rsync, name: &str) -> CoralResult<uri::Rsync> {
    uri::Rsync::from_string(format!("{base}{name}"))
        .map_err(|e| Error::custom(format!("invalid object uri: {e}")))
}

//------------ CaShadow ------------------------------------------------------

/// The local CA for one resource class held under a parent.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CaShadow {
    class_name: ResourceClassName,
    details: Vec<CaDetail>,
}

impl CaShadow {
    pub fn class_name(&self) -> &ResourceClassName {
        &self.class_name
    }

    pub fn details(&self) -> impl Iterator<Item = &CaDetail> {
        self.details.iter()
    }

    /// Each resource class has at most one active detail at a time.
    pub fn active_detail(&self) -> Option<&CaDetail> {
        self.details.iter().find(|d| d.is_active())
    }

    fn active_detail_mut(&mut self) -> Option<&mut CaDetail> {
        self.details.iter_mut().find(|d| d.is_active())
    }
}

//------------ ParentCa ------------------------------------------------------

/// An upstream issuer and the resource class shadows held under it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ParentCa {
    handle: ParentHandle,
    classes: HashMap<ResourceClassName, CaShadow>,
}

impl ParentCa {
    pub fn handle(&self) -> &ParentHandle {
        &self.handle
    }

    pub fn classes(&self) -> impl Iterator<Item = &CaShadow> {
        self.classes.values()
    }
}

//------------ CertAuth ------------------------------------------------------

/// A tenant: the resource-holding entity on whose behalf certificates are
/// issued.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CertAuth {
    handle: CaHandle,
    parents: HashMap<ParentHandle, ParentCa>,
    children: HashMap<ChildHandle, Child>,
    roas: Roas,
    ghostbusters: Ghostbusters,
    ee_certs: EeCerts,
    next_object_id: u64,
    /// Whether buffered state needs flushing at the next checkpoint.
    #[serde(skip)]
    dirty: bool,
}

impl CertAuth {
    pub fn new(handle: CaHandle) -> Self {
        CertAuth {
            handle,
            parents: HashMap::new(),
            children: HashMap::new(),
            roas: Roas::default(),
            ghostbusters: Ghostbusters::default(),
            ee_certs: EeCerts::default(),
            next_object_id: 0,
            dirty: false,
        }
    }

    pub fn handle(&self) -> &CaHandle {
        &self.handle
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_object_id;
        self.next_object_id += 1;
        id
    }

    pub fn add_parent(&mut self, parent: ParentHandle) -> CoralResult<()> {
        if self.parents.contains_key(&parent) {
            return Err(Error::custom(format!(
                "CA '{}' already has a parent named '{}'",
                self.handle, parent
            )));
        }
        self.parents.insert(
            parent.clone(),
            ParentCa {
                handle: parent,
                classes: HashMap::new(),
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// The parent handles in deterministic order.
    pub fn parent_handles(&self) -> Vec<ParentHandle> {
        let mut parents: Vec<_> = self.parents.keys().cloned().collect();
        parents.sort_by_key(|p| p.to_string());
        parents
    }

    pub fn parent(&self, parent: &ParentHandle) -> CoralResult<&ParentCa> {
        self.parents.get(parent).ok_or_else(|| {
            Error::CaParentUnknown(self.handle.clone(), parent.clone())
        })
    }

    pub fn roas(&self) -> &Roas {
        &self.roas
    }

    pub fn ghostbusters(&self) -> &Ghostbusters {
        &self.ghostbusters
    }

    pub fn ee_certs(&self) -> &EeCerts {
        &self.ee_certs
    }
}

/// # Signing keys
impl CertAuth {
    /// Finds the detail for the given signing key anywhere under this CA.
    pub fn detail(&self, key: &KeyIdentifier) -> Option<&CaDetail> {
        self.parents.values().find_map(|parent| {
            parent.classes.values().find_map(|shadow| {
                shadow.details.iter().find(|d| d.key == *key)
            })
        })
    }

    fn detail_mut(&mut self, key: &KeyIdentifier) -> Option<&mut CaDetail> {
        self.parents.values_mut().find_map(|parent| {
            parent.classes.values_mut().find_map(|shadow| {
                shadow.details.iter_mut().find(|d| d.key == *key)
            })
        })
    }

    /// The active signing key whose certified resources cover the given
    /// set, in deterministic parent/class order.
    pub fn covering_active_key(
        &self,
        resources: &ResourceSet,
    ) -> Option<KeyIdentifier> {
        for parent in self.parent_handles() {
            let Some(parent_ca) = self.parents.get(&parent) else {
                continue;
            };
            let mut class_names: Vec<_> =
                parent_ca.classes.keys().cloned().collect();
            class_names.sort_by_key(|c| c.to_string());
            for class_name in class_names {
                if let Some(detail) = parent_ca
                    .classes
                    .get(&class_name)
                    .and_then(|shadow| shadow.active_detail())
                {
                    if detail.resources.contains(resources) {
                        return Some(detail.key);
                    }
                }
            }
        }
        None
    }

    /// Signing keys whose CRL will have gone stale by the given threshold,
    /// for every active or deprecated detail.
    pub fn stale_crl_keys(&self, threshold: Time) -> Vec<KeyIdentifier> {
        let mut keys = Vec::new();
        for parent in self.parent_handles() {
            let Some(parent_ca) = self.parents.get(&parent) else {
                continue;
            };
            for shadow in parent_ca.classes.values() {
                for detail in &shadow.details {
                    if matches!(
                        detail.state,
                        CaDetailState::Active | CaDetailState::Deprecated
                    ) && detail
                        .crl
                        .as_ref()
                        .map(|crl| crl.next_update < threshold)
                        .unwrap_or(true)
                    {
                        keys.push(detail.key);
                    }
                }
            }
        }
        keys
    }

    /// Deletes revoked-key tombstones once their last CRL's nextUpdate has
    /// passed.
    pub fn purge_revoked_tombstones(
        &mut self,
        now: Time,
        publisher: &mut PublicationQueue,
    ) {
        let mut removed = false;
        for parent in self.parents.values_mut() {
            for shadow in parent.classes.values_mut() {
                shadow.details.retain(|detail| {
                    if detail.state == CaDetailState::Revoked
                        && detail
                            .crl
                            .as_ref()
                            .map(|crl| now > crl.next_update)
                            .unwrap_or(true)
                    {
                        debug!(
                            "deleting tombstone for revoked key {}",
                            detail.key
                        );
                        detail.withdraw_own_objects(publisher);
                        removed = true;
                        false
                    } else {
                        true
                    }
                });
            }
        }
        if removed {
            self.dirty = true;
        }
    }
}

/// # CRL and manifest generation
impl CertAuth {
    /// Regenerates the CRL and manifest for the given signing key and
    /// queues both for publication.
    pub fn generate_crl_and_manifest(
        &mut self,
        key: &KeyIdentifier,
        signer: &dyn ObjectSigner,
        publisher: &mut PublicationQueue,
        crl_interval: Duration,
    ) -> CoralResult<()> {
        let now = Time::now();
        let next_update = now + crl_interval;

        let number = {
            let detail =
                self.detail_mut(key).ok_or(Error::KeyUnknown(*key))?;
            detail.revocations.purge(now);
            detail.number += 1;
            detail.number
        };

        let crl = {
            let detail = self.detail(key).ok_or(Error::KeyUnknown(*key))?;
            let revocations: Vec<_> =
                detail.revocations.iter().copied().collect();
            signer.make_crl(detail, &revocations, number, next_update)?
        };

        let entries = self.manifest_entries(key, &crl);
        let manifest = {
            let detail = self.detail(key).ok_or(Error::KeyUnknown(*key))?;
            signer.make_manifest(detail, &entries, number, next_update)?
        };

        let detail = self.detail_mut(key).ok_or(Error::KeyUnknown(*key))?;
        detail.crl = Some(PublishedObject {
            uri: crl.uri.clone(),
            content: crl.content.clone(),
            next_update,
        });
        detail.manifest = Some(PublishedObject {
            uri: manifest.uri.clone(),
            content: manifest.content.clone(),
            next_update,
        });

        publisher.publish(*key, crl.uri, crl.content);
        publisher.publish(*key, manifest.uri, manifest.content);
        self.dirty = true;
        Ok(())
    }

    /// Everything currently published under the given key that the next
    /// manifest must list: the new CRL plus all subordinate objects.
    fn manifest_entries(
        &self,
        key: &KeyIdentifier,
        crl: &IssuedObject,
    ) -> Vec<ManifestEntry> {
        let mut entries = vec![ManifestEntry {
            name: ObjectName::from_uri(&crl.uri),
            content: crl.content.clone(),
        }];
        for child in self.children.values() {
            for cert in child.certs() {
                if cert.ca_key() == key {
                    entries.push(ManifestEntry {
                        name: ObjectName::from_uri(cert.uri()),
                        content: cert.content().clone(),
                    });
                }
            }
        }
        entries.extend(self.roas.manifest_entries(key));
        entries.extend(self.ghostbusters.manifest_entries(key));
        entries.extend(self.ee_certs.manifest_entries(key));
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

/// # Reconciling resource classes against a parent's answer
impl CertAuth {
    /// The resource class names currently shadowed under a parent.
    pub fn shadow_class_names(
        &self,
        parent: &ParentHandle,
    ) -> Vec<ResourceClassName> {
        let mut names: Vec<_> = self
            .parents
            .get(parent)
            .map(|p| p.classes.keys().cloned().collect())
            .unwrap_or_default();
        names.sort_by_key(|c| c.to_string());
        names
    }

    pub fn has_shadow(
        &self,
        parent: &ParentHandle,
        class_name: &ResourceClassName,
    ) -> bool {
        self.parents
            .get(parent)
            .map(|p| p.classes.contains_key(class_name))
            .unwrap_or(false)
    }

    /// Creates a new local CA shadow for a class the parent started
    /// offering.
    pub fn create_shadow(
        &mut self,
        parent: &ParentHandle,
        entitlement: &ClassEntitlement,
        signer: &dyn ObjectSigner,
        publisher: &mut PublicationQueue,
        crl_interval: Duration,
    ) -> CoralResult<()> {
        let key = signer.create_key()?;
        let detail = CaDetail::create(key, entitlement)?;

        let parent_ca = self.parents.get_mut(parent).ok_or_else(|| {
            Error::CaParentUnknown(self.handle.clone(), parent.clone())
        })?;
        if parent_ca.classes.contains_key(&entitlement.class_name) {
            return Err(Error::custom(format!(
                "resource class '{}' already exists under parent '{}'",
                entitlement.class_name, parent
            )));
        }

        info!(
            "CA '{}' created resource class '{}' under parent '{}'",
            self.handle, entitlement.class_name, parent
        );
        parent_ca.classes.insert(
            entitlement.class_name.clone(),
            CaShadow {
                class_name: entitlement.class_name.clone(),
                details: vec![detail],
            },
        );
        self.dirty = true;
        self.generate_crl_and_manifest(&key, signer, publisher, crl_interval)
    }

    /// Reconciles an existing shadow against the class payload from the
    /// parent's answer.
    pub fn reconcile_shadow(
        &mut self,
        parent: &ParentHandle,
        entitlement: &ClassEntitlement,
        signer: &dyn ObjectSigner,
        publisher: &mut PublicationQueue,
        crl_interval: Duration,
    ) -> CoralResult<()> {
        let handle = self.handle.clone();
        let parent_ca = self.parents.get_mut(parent).ok_or_else(|| {
            Error::CaParentUnknown(handle.clone(), parent.clone())
        })?;
        let shadow = parent_ca
            .classes
            .get_mut(&entitlement.class_name)
            .ok_or_else(|| {
                Error::ResourceClassUnknown(
                    handle.clone(),
                    entitlement.class_name.clone(),
                )
            })?;

        match shadow.active_detail_mut() {
            None => {
                // all prior generations gone or revoked; start a fresh one
                let key = signer.create_key()?;
                let detail = CaDetail::create(key, entitlement)?;
                info!(
                    "CA '{}' created new signing key for resource class '{}'",
                    handle, entitlement.class_name
                );
                shadow.details.push(detail);
                self.dirty = true;
                self.generate_crl_and_manifest(
                    &key,
                    signer,
                    publisher,
                    crl_interval,
                )
            }
            Some(detail) if detail.base_uri != entitlement.base_uri => {
                // the class moved; revoke the old generation and rekey
                info!(
                    "CA '{}' resource class '{}' moved to '{}', replacing \
                     signing key {}",
                    handle,
                    entitlement.class_name,
                    entitlement.base_uri,
                    detail.key
                );
                detail.state = CaDetailState::Revoked;
                let key = signer.create_key()?;
                let new_detail = CaDetail::create(key, entitlement)?;
                shadow.details.push(new_detail);
                self.dirty = true;
                self.generate_crl_and_manifest(
                    &key,
                    signer,
                    publisher,
                    crl_interval,
                )
            }
            Some(detail) => {
                if detail.resources == entitlement.resources
                    && detail.valid_until == entitlement.valid_until
                {
                    return Ok(());
                }
                debug!(
                    "CA '{}' resource class '{}' entitlements changed: \
                     old {} new {}",
                    handle,
                    entitlement.class_name,
                    detail.resources,
                    entitlement.resources
                );
                detail.resources = entitlement.resources.clone();
                detail.valid_until = entitlement.valid_until;
                let key = detail.key;
                self.dirty = true;
                self.generate_crl_and_manifest(
                    &key,
                    signer,
                    publisher,
                    crl_interval,
                )
            }
        }
    }

    /// Deletes a shadow the parent no longer offers, withdrawing everything
    /// it published. Returns the signing keys to be revoked at the parent.
    pub fn delete_shadow(
        &mut self,
        parent: &ParentHandle,
        class_name: &ResourceClassName,
        publisher: &mut PublicationQueue,
    ) -> CoralResult<Vec<KeyIdentifier>> {
        let handle = self.handle.clone();
        let parent_ca = self.parents.get_mut(parent).ok_or_else(|| {
            Error::CaParentUnknown(handle.clone(), parent.clone())
        })?;
        let shadow =
            parent_ca.classes.remove(class_name).ok_or_else(|| {
                Error::ResourceClassUnknown(
                    handle.clone(),
                    class_name.clone(),
                )
            })?;

        info!(
            "CA '{}' deleting resource class '{}' no longer offered by \
             parent '{}'",
            handle, class_name, parent
        );

        let keys: Vec<KeyIdentifier> =
            shadow.details.iter().map(|d| d.key).collect();
        for detail in &shadow.details {
            detail.withdraw_own_objects(publisher);
        }
        self.withdraw_objects_for_keys(&keys, publisher);
        self.dirty = true;
        Ok(keys)
    }

    /// Drops and withdraws every subordinate object issued by one of the
    /// given keys.
    fn withdraw_objects_for_keys(
        &mut self,
        keys: &[KeyIdentifier],
        publisher: &mut PublicationQueue,
    ) {
        for child in self.children.values_mut() {
            child.withdraw_certs_for_keys(keys, publisher);
        }
        self.roas.withdraw_for_keys(keys, publisher);
        self.ghostbusters.withdraw_for_keys(keys, publisher);
        self.ee_certs.withdraw_for_keys(keys, publisher);
    }
}

/// # Publication bookkeeping
impl CertAuth {
    /// Records an element as sent but not yet confirmed.
    pub fn record_unconfirmed(
        &mut self,
        key: KeyIdentifier,
        element: DeltaElement,
    ) {
        if let Some(detail) = self.detail_mut(&key) {
            detail
                .unconfirmed
                .insert(element.uri().clone(), element);
            self.dirty = true;
        }
    }

    /// Clears an element once the publication server confirmed it.
    pub fn confirm_published(
        &mut self,
        key: &KeyIdentifier,
        uri: &uri::Rsync,
    ) {
        if let Some(detail) = self.detail_mut(key) {
            if detail.unconfirmed.remove(uri).is_some() {
                self.dirty = true;
            }
        }
    }

    /// Everything queued but unconfirmed for the active key of each
    /// resource class, in deterministic order.
    pub fn unconfirmed_for_active_keys(
        &self,
    ) -> Vec<(KeyIdentifier, DeltaElement)> {
        let mut pending = Vec::new();
        for parent in self.parent_handles() {
            let Some(parent_ca) = self.parents.get(&parent) else {
                continue;
            };
            for shadow in parent_ca.classes.values() {
                if let Some(detail) = shadow.active_detail() {
                    for element in detail.unconfirmed.values() {
                        pending.push((detail.key, element.clone()));
                    }
                }
            }
        }
        pending.sort_by_key(|(_, e)| e.uri().to_string());
        pending
    }
}
