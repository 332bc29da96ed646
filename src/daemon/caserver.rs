//! The engine: all hosted CAs, the scheduler and the collaborator
//! endpoints, threaded through the reactor as its context.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info};
use rpki::ca::idexchange::CaHandle;

use crate::commons::error::Error;
use crate::commons::{CoralEmptyResult, CoralResult};
use crate::daemon::ca::CertAuth;
use crate::daemon::config::Config;
use crate::daemon::irdb::IrdbClient;
use crate::daemon::repo::PublicationClient;
use crate::daemon::scheduler::{
    CompletionHandler, Cont, Scheduler, Task, TaskKind,
};
use crate::daemon::signing::ObjectSigner;
use crate::daemon::updown::ProvisioningClient;
use crate::runtime::Reactor;

//------------ TenantStore ---------------------------------------------------

/// Persists CA state at checkpoints.
///
/// State is buffered and flushed when a task postpones or exits, rather
/// than on every mutation. The mapping itself lives behind this trait.
pub trait TenantStore: Send + Sync {
    fn save(&self, ca: &CertAuth) -> CoralEmptyResult;
}

/// A store that keeps nothing.
pub struct NullStore;

impl TenantStore for NullStore {
    fn save(&self, _ca: &CertAuth) -> CoralEmptyResult {
        Ok(())
    }
}

//------------ CaServer ------------------------------------------------------

pub struct CaServer {
    config: Arc<Config>,
    pub(crate) scheduler: Scheduler,
    cas: HashMap<CaHandle, CertAuth>,
    irdb: Arc<dyn IrdbClient>,
    updown: Arc<dyn ProvisioningClient>,
    repo: Arc<dyn PublicationClient>,
    signer: Arc<dyn ObjectSigner>,
    store: Arc<dyn TenantStore>,
}

impl CaServer {
    pub fn build(
        config: Arc<Config>,
        irdb: Arc<dyn IrdbClient>,
        updown: Arc<dyn ProvisioningClient>,
        repo: Arc<dyn PublicationClient>,
        signer: Arc<dyn ObjectSigner>,
        store: Arc<dyn TenantStore>,
    ) -> Self {
        CaServer {
            config,
            scheduler: Scheduler::default(),
            cas: HashMap::new(),
            irdb,
            updown,
            repo,
            signer,
            store,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn irdb(&self) -> Arc<dyn IrdbClient> {
        self.irdb.clone()
    }

    pub fn updown(&self) -> Arc<dyn ProvisioningClient> {
        self.updown.clone()
    }

    pub fn repo(&self) -> Arc<dyn PublicationClient> {
        self.repo.clone()
    }

    pub fn signer(&self) -> Arc<dyn ObjectSigner> {
        self.signer.clone()
    }
}

/// # Managing the hosted CAs
impl CaServer {
    pub fn add_ca(&mut self, ca: CertAuth) -> CoralEmptyResult {
        let handle = ca.handle().clone();
        if self.cas.contains_key(&handle) {
            return Err(Error::CaDuplicate(handle));
        }
        info!("added CA '{handle}'");
        self.cas.insert(handle, ca);
        Ok(())
    }

    pub fn remove_ca(&mut self, handle: &CaHandle) -> CoralEmptyResult {
        self.cas
            .remove(handle)
            .map(|_| info!("removed CA '{handle}'"))
            .ok_or_else(|| Error::CaUnknown(handle.clone()))
    }

    pub fn ca(&self, handle: &CaHandle) -> CoralResult<&CertAuth> {
        self.cas
            .get(handle)
            .ok_or_else(|| Error::CaUnknown(handle.clone()))
    }

    pub fn ca_mut(&mut self, handle: &CaHandle) -> CoralResult<&mut CertAuth> {
        self.cas
            .get_mut(handle)
            .ok_or_else(|| Error::CaUnknown(handle.clone()))
    }

    /// The hosted CA handles in deterministic order.
    pub fn ca_list(&self) -> Vec<CaHandle> {
        let mut cas: Vec<_> = self.cas.keys().cloned().collect();
        cas.sort_by_key(|ca| ca.to_string());
        cas
    }

    /// Flushes every CA with buffered changes through the store.
    ///
    /// This is the checkpoint tasks hit when they postpone or exit. A store
    /// failure is logged; the state stays dirty and the next checkpoint
    /// retries.
    pub fn sweep(&mut self) {
        for ca in self.cas.values_mut() {
            if ca.is_dirty() {
                match self.store.save(ca) {
                    Ok(()) => ca.clear_dirty(),
                    Err(e) => {
                        error!(
                            "could not persist state of CA '{}': {}",
                            ca.handle(),
                            e
                        )
                    }
                }
            }
        }
    }
}

/// # Scheduling
impl CaServer {
    /// Creates a fresh task instance for one CA.
    pub fn new_task(&mut self, ca: &CaHandle, kind: TaskKind) -> Task {
        let id = self.scheduler.next_task_id();
        Task::new(id, ca.clone(), kind, self.config.task_timeslice())
    }

    /// Queues one full reconciliation cycle for a CA.
    pub fn schedule_cycle(
        &mut self,
        reactor: &mut Reactor<CaServer>,
        ca: &CaHandle,
    ) {
        debug!("queueing reconciliation cycle for CA '{ca}'");
        for kind in TaskKind::ALL {
            let task = self.new_task(ca, kind);
            Scheduler::add(self, reactor, task);
        }
    }

    /// The administrative "run now" trigger: queues one round of every
    /// task kind for the CA and runs the callback once all of them have
    /// finished.
    pub fn run_now(
        &mut self,
        reactor: &mut Reactor<CaServer>,
        ca: &CaHandle,
        on_done: Cont,
    ) -> CoralEmptyResult {
        if !self.cas.contains_key(ca) {
            return Err(Error::CaUnknown(ca.clone()));
        }
        info!("running all tasks for CA '{ca}' on request");
        let handler = CompletionHandler::new(on_done);
        for kind in TaskKind::ALL {
            let task = self.new_task(ca, kind);
            handler.register(&task);
            Scheduler::add(self, reactor, task);
        }
        Ok(())
    }

    /// Arms the repeating cron timer that queues a cycle for every CA.
    pub fn arm_cron(reactor: &mut Reactor<CaServer>, first_in: chrono::Duration) {
        reactor.timers().arm_in(first_in, cron_tick);
    }
}

fn cron_tick(
    ctx: &mut CaServer,
    reactor: &mut Reactor<CaServer>,
) -> Result<(), Error> {
    debug!("cron: queueing reconciliation cycles");
    for ca in ctx.ca_list() {
        ctx.schedule_cycle(reactor, &ca);
    }
    let period = ctx.config().cron_period();
    reactor.timers().arm_in(period, cron_tick);
    Ok(())
}
