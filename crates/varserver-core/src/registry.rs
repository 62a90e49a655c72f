//! `VariableServer`: the process-wide registry mapping thread identifiers
//! to `(thread, session)` pairs, and the entry point the simulation thread
//! calls on every scheduled tick.

use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use once_cell::sync::Lazy;
use tracing::{error, info, warn};

use crate::{error::FatalExecutiveException, session::VariableServerSession, thread::VariableServerThread};

struct Entry {
    thread: Arc<VariableServerThread>,
    session: Arc<VariableServerSession>,
}

/// Process-wide registry of active client threads/sessions. All mutating
/// operations take the map mutex; `copy_data_*` holds it for the duration
/// of one tick while individual sessions still take their own copy
/// mutexes.
pub struct VariableServer {
    sessions: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    log_on: AtomicBool,
}

impl Default for VariableServer {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableServer {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1), log_on: AtomicBool::new(false) }
    }

    /// The single process-wide instance. Tests that need isolation should
    /// prefer [`VariableServer::new`] directly instead.
    pub fn global() -> &'static VariableServer {
        static INSTANCE: Lazy<VariableServer> = Lazy::new(VariableServer::new);
        &INSTANCE
    }

    /// Registers a newly accepted client, returning its thread id.
    pub fn add_session(&self, thread: Arc<VariableServerThread>, session: Arc<VariableServerSession>) -> u64 {
        let id = self.reserve_id();
        self.insert(id, thread, session);
        id
    }

    /// Allocates a thread id without registering anything yet. Lets a
    /// caller build the `on_exit` removal callback passed to
    /// [`VariableServerThread::spawn`] before the handshake resolves,
    /// closing the race where a client could disconnect and the worker
    /// exit before the entry was ever inserted.
    pub fn reserve_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Inserts the entry for a previously reserved id.
    pub fn insert(&self, id: u64, thread: Arc<VariableServerThread>, session: Arc<VariableServerSession>) {
        self.sessions.lock().unwrap().insert(id, Entry { thread, session });
        info!(thread_id = id, "varserver-core: session registered");
    }

    /// Removes `id`'s entry, if present. A worker removes itself from the
    /// map on exit, under the map mutex.
    pub fn remove(&self, id: u64) {
        if self.sessions.lock().unwrap().remove(&id).is_some() {
            info!(thread_id = id, "varserver-core: session removed");
        } else {
            warn!(thread_id = id, "varserver-core: remove of unknown session id");
        }
    }

    pub fn get_vst(&self, id: u64) -> Option<Arc<VariableServerThread>> {
        self.sessions.lock().unwrap().get(&id).map(|e| e.thread.clone())
    }

    pub fn get_session(&self, id: u64) -> Option<Arc<VariableServerSession>> {
        self.sessions.lock().unwrap().get(&id).map(|e| e.session.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Called by the simulation thread on every scheduled tick. Holds the
    /// map mutex for the duration of the broadcast; sessions that are
    /// disabled, not in `Scheduled` copy mode, or whose `next_tics` is
    /// still ahead of `current_tics` are no-ops. A panic escaping one
    /// session's callback is caught so it cannot abort the other sessions'
    /// ticks (spec §4.5/§7 `FatalExecutiveException`).
    pub fn copy_data_scheduled(&self, current_tics: u64) {
        let sessions = self.sessions.lock().unwrap();
        for (id, entry) in sessions.iter() {
            match panic::catch_unwind(AssertUnwindSafe(|| entry.session.copy_data_scheduled(current_tics))) {
                Ok(true) => {}
                Ok(false) => warn!(thread_id = id, "varserver-core: scheduled copy failed validation for a session"),
                Err(payload) => report_fatal_executive_exception(*id, entry, &payload),
            }
        }
    }

    /// Called by the simulation thread on freeze-frame ticks, independent
    /// of whether a session's regular copy mode is scheduled.
    pub fn copy_data_freeze(&self, current_tics: u64) {
        let sessions = self.sessions.lock().unwrap();
        for (id, entry) in sessions.iter() {
            match panic::catch_unwind(AssertUnwindSafe(|| entry.session.copy_data_freeze(current_tics))) {
                Ok(true) => {}
                Ok(false) => warn!(thread_id = id, "varserver-core: freeze copy failed validation for a session"),
                Err(payload) => report_fatal_executive_exception(*id, entry, &payload),
            }
        }
    }

    /// Called once per major frame before any scheduled jobs.
    pub fn copy_data_top_of_frame(&self) {
        let sessions = self.sessions.lock().unwrap();
        for (id, entry) in sessions.iter() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| entry.session.copy_data_top_of_frame())) {
                report_fatal_executive_exception(*id, entry, &payload);
            }
        }
    }

    /// Minimum `next_tics` over every enabled, scheduled session; `None`
    /// when no session wants a scheduled tick (the "+∞" sentinel of the
    /// scheduling coupling, represented as an absent value).
    pub fn get_next_tics(&self) -> Option<u64> {
        self.sessions.lock().unwrap().values().filter_map(|e| e.session.get_next_tics()).min()
    }

    /// Enables command logging on every currently-registered session.
    /// New sessions created afterward are unaffected; each session's own
    /// `log_on`/`log_off` command remains the per-client override.
    pub fn set_var_server_log_on(&self) {
        self.log_on.store(true, Ordering::SeqCst);
    }

    pub fn set_var_server_log_off(&self) {
        self.log_on.store(false, Ordering::SeqCst);
    }

    pub fn is_var_server_log_on(&self) -> bool {
        self.log_on.load(Ordering::SeqCst)
    }

    /// Checkpoint restart: pauses every registered session for the
    /// duration of `restart`, then revalidates every reference
    /// (re-resolving through the memory manager) before restoring each
    /// session's prior pause state. `restart`'s failure modes are the
    /// caller's concern; this only brackets it with the pause/revalidate
    /// protocol.
    pub fn checkpoint_restart(&self, restart: impl FnOnce()) {
        let threads: Vec<Arc<VariableServerThread>> =
            self.sessions.lock().unwrap().values().map(|e| e.thread.clone()).collect();

        let saved_pause: Vec<bool> = threads.iter().map(|t| t.session().is_paused()).collect();
        let guards: Vec<_> = threads.iter().map(|t| t.restart_pause_gate().lock().unwrap()).collect();

        for t in &threads {
            t.session().set_paused(true);
        }

        restart();

        for t in &threads {
            t.session().revalidate_references();
        }
        for (t, was_paused) in threads.iter().zip(saved_pause) {
            t.session().set_paused(was_paused);
        }

        drop(guards);
        info!(sessions = threads.len(), "varserver-core: checkpoint restart complete");
    }
}

/// A panic caught from a session's scheduled callback is fatal to that
/// session alone (spec §7): logged as a `FatalExecutiveException` and the
/// owning worker is asked to exit, while the tick loop continues on to the
/// remaining sessions.
fn report_fatal_executive_exception(id: u64, entry: &Entry, payload: &(dyn std::any::Any + Send)) {
    let err = FatalExecutiveException(panic_message(payload));
    error!(thread_id = id, %err, "varserver-core: scheduled callback panicked, requesting worker exit");
    entry.thread.request_exit();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "scheduled callback panicked with a non-string payload".to_string()
    }
}
