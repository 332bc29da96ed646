//! The cooperative task scheduler: per-CA queues of reconciliation tasks,
//! run one at a time, with voluntary time-slicing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use rpki::ca::idexchange::CaHandle;
use rpki::repository::x509::Time;
use serde::{Deserialize, Serialize};

use crate::daemon::caserver::CaServer;
use crate::daemon::tasks;
use crate::runtime::Reactor;

//------------ Continuation types --------------------------------------------

/// A saved resume point of a task, or a callback into the engine.
pub type Cont = Box<dyn FnOnce(&mut CaServer, &mut Reactor<CaServer>) + Send>;

/// A callback fired when a task exits.
pub type CompletionFn =
    Box<dyn FnOnce(&mut CaServer, &mut Reactor<CaServer>, &Task) + Send>;

//------------ TaskKind ------------------------------------------------------

/// The reconciliation workflows the scheduler knows how to run.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    PollParents,
    UpdateChildren,
    UpdateRoas,
    UpdateGhostbusters,
    UpdateEeCertificates,
    RegenerateCrlsAndManifests,
    CheckFailedPublication,
}

impl TaskKind {
    /// Every kind, in the order a full cycle queues them.
    pub const ALL: [TaskKind; 7] = [
        TaskKind::PollParents,
        TaskKind::UpdateChildren,
        TaskKind::UpdateRoas,
        TaskKind::UpdateGhostbusters,
        TaskKind::UpdateEeCertificates,
        TaskKind::RegenerateCrlsAndManifests,
        TaskKind::CheckFailedPublication,
    ];
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskKind::PollParents => {
                write!(f, "synchronize resource classes with parents")
            }
            TaskKind::UpdateChildren => {
                write!(f, "update issued child certificates")
            }
            TaskKind::UpdateRoas => write!(f, "update ROAs"),
            TaskKind::UpdateGhostbusters => {
                write!(f, "update ghostbuster records")
            }
            TaskKind::UpdateEeCertificates => {
                write!(f, "update EE certificates")
            }
            TaskKind::RegenerateCrlsAndManifests => {
                write!(f, "regenerate CRLs and manifests")
            }
            TaskKind::CheckFailedPublication => {
                write!(f, "retry failed publication")
            }
        }
    }
}

//------------ TaskState -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    Idle,
    Running,
    Postponed,
    Done,
}

//------------ Task ----------------------------------------------------------

/// One schedulable unit of reconciliation work for one CA.
///
/// The handle is cheap to clone; workflow steps carry it through their
/// continuations to postpone, check pacing, and finally exit.
#[derive(Clone)]
pub struct Task {
    inner: Arc<Mutex<TaskInner>>,
}

struct TaskInner {
    id: u64,
    ca: CaHandle,
    kind: TaskKind,
    state: TaskState,
    timeslice: chrono::Duration,
    due_date: Option<Time>,
    continuation: Option<Cont>,
    completions: Vec<CompletionFn>,
}

impl Task {
    pub fn new(
        id: u64,
        ca: CaHandle,
        kind: TaskKind,
        timeslice: chrono::Duration,
    ) -> Self {
        Task {
            inner: Arc::new(Mutex::new(TaskInner {
                id,
                ca,
                kind,
                state: TaskState::Idle,
                timeslice,
                due_date: None,
                continuation: None,
                completions: Vec::new(),
            })),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.lock().unwrap().id
    }

    pub fn tenant(&self) -> CaHandle {
        self.inner.lock().unwrap().ca.clone()
    }

    pub fn kind(&self) -> TaskKind {
        self.inner.lock().unwrap().kind
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().unwrap().state
    }

    /// Registers a callback to run exactly once when the task exits.
    pub fn register_completion(&self, completion: CompletionFn) {
        self.inner.lock().unwrap().completions.push(completion);
    }

    /// Whether the task has run past its time-slice and should consider
    /// yielding. Advisory pacing only; nothing preempts.
    pub fn overdue(&self) -> bool {
        match self.inner.lock().unwrap().due_date {
            Some(due) => Time::now() > due,
            None => false,
        }
    }

    /// Runs the task: its saved continuation if it was postponed, its
    /// workflow entry point otherwise.
    pub(crate) fn invoke(
        &self,
        ctx: &mut CaServer,
        reactor: &mut Reactor<CaServer>,
    ) {
        let (kind, continuation) = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = TaskState::Running;
            inner.due_date = Some(Time::now() + inner.timeslice);
            (inner.kind, inner.continuation.take())
        };
        match continuation {
            Some(continuation) => {
                debug!("restarting task {self}");
                continuation(ctx, reactor)
            }
            None => {
                debug!("running task {self}");
                tasks::start(kind, self.clone(), ctx, reactor)
            }
        }
    }

    /// Voluntarily yields: saves the resume point, re-queues the task at
    /// the front of its CA's queue and gives the reactor a turn.
    pub fn postpone(
        &self,
        continuation: Cont,
        ctx: &mut CaServer,
        reactor: &mut Reactor<CaServer>,
    ) {
        ctx.sweep();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.continuation = Some(continuation);
            inner.due_date = None;
            inner.state = TaskState::Postponed;
        }
        debug!("postponing task {self}");
        ctx.scheduler.push_front(self.clone());
        Scheduler::advance(ctx, reactor, self);
    }

    /// Marks the task complete: flushes buffered state, fires every
    /// registered completion callback exactly once each, clears per-run
    /// state and advances the queue.
    pub fn exit(&self, ctx: &mut CaServer, reactor: &mut Reactor<CaServer>) {
        ctx.sweep();
        let completions = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = TaskState::Done;
            inner.due_date = None;
            inner.continuation = None;
            std::mem::take(&mut inner.completions)
        };
        debug!("task {self} done");
        for completion in completions {
            completion(ctx, reactor, self);
        }
        Scheduler::advance(ctx, reactor, self);
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (ca, kind) = {
            let inner = self.inner.lock().unwrap();
            (inner.ca.clone(), inner.kind)
        };
        write!(f, "'{kind}' for CA '{ca}'")
    }
}

//------------ CompletionHandler ---------------------------------------------

/// Tracks a set of scheduled tasks and runs one terminal callback when the
/// last of them finishes.
#[derive(Clone)]
pub struct CompletionHandler {
    inner: Arc<Mutex<CompletionInner>>,
}

struct CompletionInner {
    tasks: HashSet<u64>,
    callback: Option<Cont>,
}

impl CompletionHandler {
    pub fn new(callback: Cont) -> Self {
        CompletionHandler {
            inner: Arc::new(Mutex::new(CompletionInner {
                tasks: HashSet::new(),
                callback: Some(callback),
            })),
        }
    }

    pub fn register(&self, task: &Task) {
        self.inner.lock().unwrap().tasks.insert(task.id());
        let handler = self.clone();
        task.register_completion(Box::new(move |ctx, reactor, task| {
            handler.done(ctx, reactor, task)
        }));
    }

    /// The number of registered tasks still outstanding.
    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn done(
        &self,
        ctx: &mut CaServer,
        reactor: &mut Reactor<CaServer>,
        task: &Task,
    ) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.tasks.remove(&task.id()) {
                warn!(
                    "completion handler called with unregistered task \
                     {task}, blundering onwards"
                );
            }
            if inner.tasks.is_empty() {
                inner.callback.take()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            callback(ctx, reactor);
        }
    }
}

//------------ Scheduler -----------------------------------------------------

/// Per-CA task queues plus the single in-flight task.
///
/// One CA's queued tasks run to full completion, including every
/// postponement, before the scheduler advances to that CA's next queued
/// task; only I/O waits interleave.
pub struct Scheduler {
    queues: HashMap<CaHandle, VecDeque<Task>>,
    /// CAs with queued work, in arrival order.
    order: VecDeque<CaHandle>,
    active: Option<Task>,
    next_task_id: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler {
            queues: HashMap::new(),
            order: VecDeque::new(),
            active: None,
            next_task_id: 0,
        }
    }
}

impl Scheduler {
    pub fn next_task_id(&mut self) -> u64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    pub fn queued(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queues.is_empty()
    }

    fn push_back(&mut self, task: Task) {
        let ca = task.tenant();
        let queue = self.queues.entry(ca.clone()).or_default();
        if queue.is_empty() && !self.order.contains(&ca) {
            self.order.push_back(ca);
        }
        queue.push_back(task);
    }

    pub(crate) fn push_front(&mut self, task: Task) {
        let ca = task.tenant();
        let queue = self.queues.entry(ca.clone()).or_default();
        if queue.is_empty() && !self.order.contains(&ca) {
            // resuming a postponed task; its CA runs next
            self.order.push_front(ca);
        }
        queue.push_front(task);
    }

    fn pop_next(&mut self) -> Option<Task> {
        let ca = self.order.front()?.clone();
        let queue = self.queues.get_mut(&ca)?;
        let task = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&ca);
            self.order.pop_front();
        }
        task
    }

    /// Queues a task and starts pumping if the scheduler was idle.
    pub fn add(
        ctx: &mut CaServer,
        reactor: &mut Reactor<CaServer>,
        task: Task,
    ) {
        debug!("queueing task {task}");
        ctx.scheduler.push_back(task);
        Self::kick(ctx, reactor);
    }

    /// Defers one attempt to run the next queued task.
    fn kick(ctx: &mut CaServer, reactor: &mut Reactor<CaServer>) {
        if ctx.scheduler.active.is_none() {
            reactor.defer(Box::new(Self::run_next));
        }
    }

    fn run_next(ctx: &mut CaServer, reactor: &mut Reactor<CaServer>) {
        if ctx.scheduler.active.is_some() {
            return;
        }
        let Some(task) = ctx.scheduler.pop_next() else {
            return;
        };
        ctx.scheduler.active = Some(task.clone());
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            task.invoke(ctx, reactor)
        }));
        if outcome.is_err() {
            error!(
                "task {task} failed with a panic before completing, \
                 continuing with the next queued task"
            );
            Self::advance(ctx, reactor, &task);
        }
    }

    /// Clears the in-flight slot if it belongs to the given task and pumps
    /// the queue again.
    pub(crate) fn advance(
        ctx: &mut CaServer,
        reactor: &mut Reactor<CaServer>,
        task: &Task,
    ) {
        if ctx
            .scheduler
            .active
            .as_ref()
            .map(|active| active.id() == task.id())
            .unwrap_or(false)
        {
            ctx.scheduler.active = None;
        }
        Self::kick(ctx, reactor);
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::test::{ca_handle, test_server};

    use super::*;

    fn noop_task(ctx: &mut CaServer, ca: &str) -> Task {
        // a task kind that exits without any collaborator round trips
        ctx.new_task(&ca_handle(ca), TaskKind::CheckFailedPublication)
    }

    #[test]
    fn completion_handler_fires_exactly_once() {
        let (mut server, mut reactor, _bench) = test_server();
        server
            .add_ca(crate::daemon::ca::CertAuth::new(ca_handle("alice")))
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        let handler = CompletionHandler::new(Box::new(move |_, _| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        }));

        let one = noop_task(&mut server, "alice");
        let two = noop_task(&mut server, "alice");
        handler.register(&one);
        handler.register(&two);
        assert_eq!(handler.count(), 2);

        Scheduler::add(&mut server, &mut reactor, one);
        Scheduler::add(&mut server, &mut reactor, two);
        reactor.run(&mut server).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(handler.count(), 0);
    }

    #[test]
    fn done_with_unregistered_task_never_fires() {
        let (mut server, mut reactor, _bench) = test_server();
        server
            .add_ca(crate::daemon::ca::CertAuth::new(ca_handle("alice")))
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        let handler = CompletionHandler::new(Box::new(move |_, _| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        }));

        let registered = noop_task(&mut server, "alice");
        let stranger = noop_task(&mut server, "alice");
        handler.register(&registered);

        // tolerated with a warning, no callback
        handler.done(&mut server, &mut reactor, &stranger);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(handler.count(), 1);

        handler.done(&mut server, &mut reactor, &registered);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_tenants_queue_completes_before_the_next() {
        let (mut server, mut reactor, _bench) = test_server();
        server
            .add_ca(crate::daemon::ca::CertAuth::new(ca_handle("alice")))
            .unwrap();
        server
            .add_ca(crate::daemon::ca::CertAuth::new(ca_handle("bob")))
            .unwrap();

        let order: Arc<Mutex<Vec<String>>> =
            Arc::new(Mutex::new(Vec::new()));
        let record = |name: &'static str| {
            let order = order.clone();
            Box::new(
                move |_: &mut CaServer,
                      _: &mut Reactor<CaServer>,
                      _: &Task| {
                    order.lock().unwrap().push(name.to_string());
                },
            )
        };

        let alice_one = noop_task(&mut server, "alice");
        alice_one.register_completion(record("alice-1"));
        let bob_one = noop_task(&mut server, "bob");
        bob_one.register_completion(record("bob-1"));
        let alice_two = noop_task(&mut server, "alice");
        alice_two.register_completion(record("alice-2"));

        Scheduler::add(&mut server, &mut reactor, alice_one);
        Scheduler::add(&mut server, &mut reactor, bob_one);
        Scheduler::add(&mut server, &mut reactor, alice_two);
        reactor.run(&mut server).unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["alice-1", "alice-2", "bob-1"]
        );
    }

    #[test]
    fn a_task_panicking_before_exit_does_not_stall_the_queue() {
        let (mut server, mut reactor, bench) = test_server();
        server
            .add_ca(crate::daemon::ca::CertAuth::new(ca_handle("alice")))
            .unwrap();
        bench.irdb.data.lock().unwrap().panic_on_roa_requests = true;

        let failing =
            server.new_task(&ca_handle("alice"), TaskKind::UpdateRoas);
        let follow_up = noop_task(&mut server, "alice");

        Scheduler::add(&mut server, &mut reactor, failing.clone());
        Scheduler::add(&mut server, &mut reactor, follow_up.clone());
        reactor.run(&mut server).unwrap();

        assert_ne!(failing.state(), TaskState::Done);
        assert_eq!(follow_up.state(), TaskState::Done);
        assert!(server.scheduler.is_idle());
    }
}
