//! Helpers for testing the engine: handle and resource constructors plus
//! scriptable in-memory collaborators.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rpki::ca::idexchange::{CaHandle, ChildHandle, ParentHandle};
use rpki::ca::provisioning::ResourceClassName;
use rpki::crypto::KeyIdentifier;
use rpki::repository::resources::ResourceSet;
use rpki::repository::x509::Time;
use rpki::uri;

use crate::commons::api::{
    Base64, ChildEntitlement, ClassEntitlement, EeCertRequest,
    GhostbusterRequest, PublishDelta, PublishReply, Revocation, RoaPayload,
};
use crate::commons::error::Error;
use crate::commons::{CoralEmptyResult, CoralResult};
use crate::daemon::ca::{CaDetail, CertAuth, PublicationQueue};
use crate::daemon::caserver::{CaServer, TenantStore};
use crate::daemon::config::Config;
use crate::daemon::irdb::IrdbClient;
use crate::daemon::repo::PublicationClient;
use crate::daemon::scheduler::{Scheduler, Task, TaskKind};
use crate::daemon::signing::{IssuedObject, ManifestEntry, ObjectSigner};
use crate::daemon::updown::ProvisioningClient;
use crate::runtime::{Reactor, Reply};

//------------ Constructors --------------------------------------------------

pub fn ca_handle(s: &str) -> CaHandle {
    CaHandle::from_str(s).unwrap()
}

pub fn parent_handle(s: &str) -> ParentHandle {
    ParentHandle::from_str(s).unwrap()
}

pub fn child_handle(s: &str) -> ChildHandle {
    ChildHandle::from_str(s).unwrap()
}

pub fn rsync(s: &str) -> uri::Rsync {
    uri::Rsync::from_str(s).unwrap()
}

pub fn resources(asns: &str, v4: &str, v6: &str) -> ResourceSet {
    ResourceSet::from_strs(asns, v4, v6).unwrap()
}

pub fn key_id(n: u64) -> KeyIdentifier {
    KeyIdentifier::from_str(&format!("{n:040x}")).unwrap()
}

pub fn in_weeks(weeks: i64) -> Time {
    Time::now() + chrono::Duration::weeks(weeks)
}

//------------ TestIrdb ------------------------------------------------------

/// A scriptable IRDB that answers inline.
#[derive(Default)]
pub struct TestIrdb {
    pub data: Mutex<IrdbData>,
}

#[derive(Default)]
pub struct IrdbData {
    pub child_resources: HashMap<(CaHandle, ChildHandle), ChildEntitlement>,
    pub roa_requests: HashMap<CaHandle, Vec<RoaPayload>>,
    pub ghostbuster_requests: HashMap<CaHandle, Vec<GhostbusterRequest>>,
    pub ee_requests: HashMap<CaHandle, Vec<EeCertRequest>>,
    pub fail_roa_requests: bool,
    pub panic_on_roa_requests: bool,
}

impl IrdbClient for TestIrdb {
    fn child_resources(
        &self,
        ca: &CaHandle,
        child: &ChildHandle,
        reply: Reply<CaServer, ChildEntitlement>,
    ) {
        let entitlement = self
            .data
            .lock()
            .unwrap()
            .child_resources
            .get(&(ca.clone(), child.clone()))
            .cloned();
        match entitlement {
            Some(entitlement) => reply.ok(entitlement),
            None => reply.err(Error::IrdbError(format!(
                "no resources known for child '{child}'"
            ))),
        }
    }

    fn roa_requests(
        &self,
        ca: &CaHandle,
        reply: Reply<CaServer, Vec<RoaPayload>>,
    ) {
        let (panic_requested, fail, requests) = {
            let data = self.data.lock().unwrap();
            (
                data.panic_on_roa_requests,
                data.fail_roa_requests,
                data.roa_requests.get(ca).cloned().unwrap_or_default(),
            )
        };
        if panic_requested {
            panic!("irdb was scripted to panic");
        }
        if fail {
            reply.err(Error::IrdbError("scripted failure".to_string()));
        } else {
            reply.ok(requests);
        }
    }

    fn ghostbuster_requests(
        &self,
        ca: &CaHandle,
        _parents: Vec<ParentHandle>,
        reply: Reply<CaServer, Vec<GhostbusterRequest>>,
    ) {
        let requests = self
            .data
            .lock()
            .unwrap()
            .ghostbuster_requests
            .get(ca)
            .cloned()
            .unwrap_or_default();
        reply.ok(requests);
    }

    fn ee_certificate_requests(
        &self,
        ca: &CaHandle,
        reply: Reply<CaServer, Vec<EeCertRequest>>,
    ) {
        let requests = self
            .data
            .lock()
            .unwrap()
            .ee_requests
            .get(ca)
            .cloned()
            .unwrap_or_default();
        reply.ok(requests);
    }
}

//------------ TestParents ---------------------------------------------------

/// A scriptable up-down exchange.
#[derive(Default)]
pub struct TestParents {
    pub classes:
        Mutex<HashMap<(CaHandle, ParentHandle), Vec<ClassEntitlement>>>,
    pub revoked: Mutex<Vec<KeyIdentifier>>,
    pub fail_list: AtomicBool,
}

impl ProvisioningClient for TestParents {
    fn list(
        &self,
        ca: &CaHandle,
        parent: &ParentHandle,
        reply: Reply<CaServer, Vec<ClassEntitlement>>,
    ) {
        if self.fail_list.swap(false, Ordering::SeqCst) {
            reply.err(Error::UpDownError(
                "scripted list failure".to_string(),
            ));
            return;
        }
        let classes = self
            .classes
            .lock()
            .unwrap()
            .get(&(ca.clone(), parent.clone()))
            .cloned()
            .unwrap_or_default();
        reply.ok(classes);
    }

    fn revoke_key(
        &self,
        _ca: &CaHandle,
        _parent: &ParentHandle,
        key: KeyIdentifier,
        reply: Reply<CaServer, ()>,
    ) {
        self.revoked.lock().unwrap().push(key);
        reply.ok(());
    }
}

//------------ TestRepo ------------------------------------------------------

/// A publication server that records every delta it confirms.
#[derive(Default)]
pub struct TestRepo {
    pub deltas: Mutex<Vec<(CaHandle, PublishDelta)>>,
    pub fail_next: AtomicBool,
}

impl TestRepo {
    /// The number of exchanges so far.
    pub fn exchanges(&self) -> usize {
        self.deltas.lock().unwrap().len()
    }

    pub fn last_delta(&self) -> Option<PublishDelta> {
        self.deltas.lock().unwrap().last().map(|(_, d)| d.clone())
    }
}

impl PublicationClient for TestRepo {
    fn publish(
        &self,
        ca: &CaHandle,
        delta: PublishDelta,
        reply: Reply<CaServer, PublishReply>,
    ) {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            reply.err(Error::PublicationError(
                "scripted outage".to_string(),
            ));
            return;
        }
        let confirmed =
            delta.elements().iter().map(|e| e.uri().clone()).collect();
        self.deltas.lock().unwrap().push((ca.clone(), delta));
        reply.ok(PublishReply {
            confirmed,
            errors: Vec::new(),
        });
    }
}

//------------ TestSigner ----------------------------------------------------

/// A signer producing descriptive placeholder content.
#[derive(Default)]
pub struct TestSigner {
    counter: AtomicU64,
}

impl TestSigner {
    fn next_key(&self) -> CoralResult<KeyIdentifier> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        KeyIdentifier::from_str(&format!("{n:040x}"))
            .map_err(Error::signer)
    }
}

impl ObjectSigner for TestSigner {
    fn create_key(&self) -> CoralResult<KeyIdentifier> {
        self.next_key()
    }

    fn issue_child_cert(
        &self,
        issuer: &CaDetail,
        child: &ChildHandle,
        key: KeyIdentifier,
        resources: &ResourceSet,
        valid_until: Time,
    ) -> CoralResult<IssuedObject> {
        Ok(IssuedObject {
            uri: issuer.object_uri(&format!("{key}.cer"))?,
            content: Base64::from_content(
                format!("cer {child} {key} {resources}").as_bytes(),
            ),
            key,
            valid_until,
        })
    }

    fn make_roa(
        &self,
        issuer: &CaDetail,
        payload: &RoaPayload,
    ) -> CoralResult<IssuedObject> {
        let ee = self.next_key()?;
        Ok(IssuedObject {
            uri: issuer.object_uri(&format!("{ee}.roa"))?,
            content: Base64::from_content(
                format!("roa {payload}").as_bytes(),
            ),
            key: ee,
            valid_until: in_weeks(52),
        })
    }

    fn make_ghostbuster(
        &self,
        issuer: &CaDetail,
        vcard: &str,
    ) -> CoralResult<IssuedObject> {
        let ee = self.next_key()?;
        Ok(IssuedObject {
            uri: issuer.object_uri(&format!("{ee}.gbr"))?,
            content: Base64::from_content(
                format!("gbr {vcard}").as_bytes(),
            ),
            key: ee,
            valid_until: in_weeks(52),
        })
    }

    fn make_ee_certificate(
        &self,
        issuer: &CaDetail,
        request: &EeCertRequest,
    ) -> CoralResult<IssuedObject> {
        Ok(IssuedObject {
            uri: issuer.object_uri(&format!("{}.cer", request.key))?,
            content: Base64::from_content(
                format!(
                    "ee {} {} {}",
                    request.key, request.subject, request.resources
                )
                .as_bytes(),
            ),
            key: request.key,
            valid_until: request.valid_until,
        })
    }

    fn make_crl(
        &self,
        issuer: &CaDetail,
        revocations: &[Revocation],
        number: u64,
        next_update: Time,
    ) -> CoralResult<IssuedObject> {
        Ok(IssuedObject {
            uri: issuer.object_uri(&format!("{}.crl", issuer.key()))?,
            content: Base64::from_content(
                format!(
                    "crl {} #{} revoked {}",
                    issuer.key(),
                    number,
                    revocations.len()
                )
                .as_bytes(),
            ),
            key: *issuer.key(),
            valid_until: next_update,
        })
    }

    fn make_manifest(
        &self,
        issuer: &CaDetail,
        entries: &[ManifestEntry],
        number: u64,
        next_update: Time,
    ) -> CoralResult<IssuedObject> {
        let names: Vec<&str> =
            entries.iter().map(|e| e.name.as_str()).collect();
        Ok(IssuedObject {
            uri: issuer.object_uri(&format!("{}.mft", issuer.key()))?,
            content: Base64::from_content(
                format!(
                    "mft {} #{} [{}]",
                    issuer.key(),
                    number,
                    names.join(" ")
                )
                .as_bytes(),
            ),
            key: *issuer.key(),
            valid_until: next_update,
        })
    }
}

//------------ MemoryStore ---------------------------------------------------

/// A tenant store keeping the serialized state of every flushed CA.
#[derive(Default)]
pub struct MemoryStore {
    pub saved: Mutex<HashMap<CaHandle, serde_json::Value>>,
}

impl TenantStore for MemoryStore {
    fn save(&self, ca: &CertAuth) -> CoralEmptyResult {
        let value = serde_json::to_value(ca)
            .map_err(|e| Error::custom(format!("cannot serialize CA: {e}")))?;
        self.saved
            .lock()
            .unwrap()
            .insert(ca.handle().clone(), value);
        Ok(())
    }
}

//------------ TestBench -----------------------------------------------------

/// All the mock collaborators behind a test engine.
pub struct TestBench {
    pub irdb: Arc<TestIrdb>,
    pub parents: Arc<TestParents>,
    pub repo: Arc<TestRepo>,
    pub signer: Arc<TestSigner>,
    pub store: Arc<MemoryStore>,
}

/// Builds an engine over mock collaborators and a signal-free reactor.
pub fn test_server() -> (CaServer, Reactor<CaServer>, TestBench) {
    test_server_with(Config::defaults())
}

/// Like [`test_server`], with explicit configuration.
pub fn test_server_with(
    config: Config,
) -> (CaServer, Reactor<CaServer>, TestBench) {
    let bench = TestBench {
        irdb: Arc::new(TestIrdb::default()),
        parents: Arc::new(TestParents::default()),
        repo: Arc::new(TestRepo::default()),
        signer: Arc::new(TestSigner::default()),
        store: Arc::new(MemoryStore::default()),
    };
    let server = CaServer::build(
        Arc::new(config),
        bench.irdb.clone(),
        bench.parents.clone(),
        bench.repo.clone(),
        bench.signer.clone(),
        bench.store.clone(),
    );
    (server, Reactor::without_signals(), bench)
}

/// Queues one task and drives the reactor until all work is done.
pub fn run_task(
    server: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
    ca: &CaHandle,
    kind: TaskKind,
) -> Task {
    let task = server.new_task(ca, kind);
    Scheduler::add(server, reactor, task.clone());
    reactor.run(server).unwrap();
    task
}

/// Creates a CA with one parent offering one resource class and runs the
/// parent poll so the local shadow and signing key exist.
pub fn bootstrap_ca(
    server: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
    bench: &TestBench,
    name: &str,
) -> CaHandle {
    let handle = ca_handle(name);
    let parent = parent_handle("ripe");

    let mut ca = CertAuth::new(handle.clone());
    ca.add_parent(parent.clone()).unwrap();
    server.add_ca(ca).unwrap();

    bench.parents.classes.lock().unwrap().insert(
        (handle.clone(), parent),
        vec![ClassEntitlement {
            class_name: ResourceClassName::default(),
            resources: resources("", "10.0.0.0/8, 192.168.0.0/16", ""),
            base_uri: rsync(&format!(
                "rsync://repo.example.org/repo/{name}/0/"
            )),
            valid_until: in_weeks(52),
        }],
    );

    run_task(server, reactor, &handle, TaskKind::PollParents);
    handle
}

/// The active signing key of the CA's only resource class.
pub fn active_key(server: &CaServer, ca: &CaHandle) -> KeyIdentifier {
    let ca = server.ca(ca).unwrap();
    let parent = ca.parent_handles().pop().unwrap();
    let parent = ca.parent(&parent).unwrap();
    let shadow = parent.classes().next().unwrap();
    *shadow.active_detail().unwrap().key()
}

/// Issues a certificate to a (new) child key, bypassing publication.
pub fn give_child_a_cert(
    server: &mut CaServer,
    ca: &CaHandle,
    child: &ChildHandle,
    key: KeyIdentifier,
    child_resources: ResourceSet,
) {
    let signer = server.signer();
    let mut publisher = PublicationQueue::default();
    let ca = server.ca_mut(ca).unwrap();
    if ca.child(child).is_err() {
        ca.add_child(child.clone()).unwrap();
    }
    ca.issue_child_cert(
        child,
        key,
        &child_resources,
        in_weeks(30),
        &*signer,
        &mut publisher,
        chrono::Duration::hours(24),
    )
    .unwrap();
}
