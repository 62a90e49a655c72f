//! `VariableServerThread` (spec §4.5): brings up one client's connection,
//! runs its session's main loop, and tears it down. Exactly one thread per
//! client; see spec §5 for the concurrency model this participates in.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{command::{CopyMode, WriteMode}, session::VariableServerSession};

/// `CONNECTION_PENDING → CONNECTION_SUCCESS | CONNECTION_FAIL` (spec §4.5).
/// A thread observing `ConnectionFail` must not reference the session: no
/// registration with [`crate::registry::VariableServer`] ever happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    ConnectionPending,
    ConnectionSuccess,
    ConnectionFail,
}

/// Granularity of the cancellable sleep between main-loop iterations and of
/// the restart-pause poll. Small enough that an exit command or a restart
/// request is honored promptly without a dedicated wakeup channel.
const POLL_GRANULARITY: Duration = Duration::from_millis(5);

/// Owns one worker thread executing one session (spec §4.5). The
/// connection itself lives inside the session (handed over at
/// construction); this type only manages the thread's lifecycle, handshake
/// signaling, and the checkpoint-restart pause gate.
pub struct VariableServerThread {
    session: Arc<VariableServerSession>,
    status: Arc<(Mutex<ThreadStatus>, Condvar)>,
    /// Taken for the duration of a server-wide checkpoint restart (spec
    /// §4.5): the worker loop re-acquires-and-releases it once per
    /// iteration, so a registry holding it for every thread blocks every
    /// worker at the top of its loop without a dedicated cancellation
    /// signal.
    restart_pause: Arc<Mutex<()>>,
    cancel: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl VariableServerThread {
    /// Spawns the worker. `on_exit` runs once, after the main loop breaks
    /// for any reason, before the connection is closed — the registry uses
    /// it to remove this thread's entry from its map (spec §4.5: "removes
    /// itself from the server map under the map mutex").
    pub fn spawn(
        session: Arc<VariableServerSession>,
        on_exit: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        let status = Arc::new((Mutex::new(ThreadStatus::ConnectionPending), Condvar::new()));
        let restart_pause = Arc::new(Mutex::new(()));
        let cancel = Arc::new(AtomicBool::new(false));

        let thread_session = session.clone();
        let thread_status = status.clone();
        let thread_restart_pause = restart_pause.clone();
        let thread_cancel = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("varserver-worker".to_string())
            .spawn(move || {
                run(thread_session, thread_status, thread_restart_pause, thread_cancel, on_exit)
            })
            .expect("failed to spawn varserver worker thread");

        Arc::new(Self {
            session,
            status,
            restart_pause,
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn session(&self) -> &Arc<VariableServerSession> {
        &self.session
    }

    /// Blocks until the handshake resolves to `ConnectionSuccess` or
    /// `ConnectionFail` (spec §4.5).
    pub fn wait_for_accept(&self) -> ThreadStatus {
        let (lock, cvar) = &*self.status;
        let mut guard = lock.lock().unwrap();
        while *guard == ThreadStatus::ConnectionPending {
            guard = cvar.wait(guard).unwrap();
        }
        *guard
    }

    pub fn status(&self) -> ThreadStatus {
        *self.status.0.lock().unwrap()
    }

    /// Cooperative cancellation: unblocks the sleep between loop
    /// iterations. Honored within one `update_rate` (spec §5).
    pub fn request_exit(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// The gate the checkpoint-restart coupling locks (spec §4.5,
    /// `VariableServer::checkpoint_restart`).
    pub(crate) fn restart_pause_gate(&self) -> &Mutex<()> {
        &self.restart_pause
    }

    /// Blocks until the worker thread has terminated. Bounded by the
    /// thread's own cancellation latency (spec §5: "join must complete
    /// within a bounded time").
    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            if let Err(payload) = handle.join() {
                error!(?payload, "varserver-core: worker thread panicked");
            }
        }
    }
}

fn run(
    session: Arc<VariableServerSession>,
    status: Arc<(Mutex<ThreadStatus>, Condvar)>,
    restart_pause: Arc<Mutex<()>>,
    cancel: Arc<AtomicBool>,
    on_exit: impl FnOnce(),
) {
    if let Err(err) = session.start_connection() {
        warn!(%err, "varserver-core: worker exiting, handshake never completed");
        set_status(&status, ThreadStatus::ConnectionFail);
        session.close();
        return;
    }
    set_status(&status, ThreadStatus::ConnectionSuccess);
    session.mark_ready();
    info!("varserver-core: client session established");

    main_loop(&session, &restart_pause, &cancel);

    on_exit();
    session.disconnect_references();
    session.close();
    // Re-notify in case anything is still parked on the handshake condvar;
    // by now status is already resolved, this only guards against a
    // spurious late waiter.
    status.1.notify_all();
    debug!("varserver-core: client session torn down");
}

/// One iteration implements spec §4.4's five-step main loop. `copy_mode`
/// and `write_mode` form the two-dimensional transition table spec §9
/// calls for, rather than nested branching.
fn main_loop(session: &Arc<VariableServerSession>, restart_pause: &Mutex<()>, cancel: &AtomicBool) {
    loop {
        // Block here for the duration of any in-progress checkpoint
        // restart (see `restart_pause` field docs).
        drop(restart_pause.lock().unwrap());

        if cancel.load(Ordering::SeqCst) || session.get_exit_cmd() {
            break;
        }

        if let Err(err) = session.handle_message() {
            debug!(%err, "varserver-core: worker exiting, connection is terminal");
            break;
        }

        let mut copied_this_iteration = false;
        if session.copy_mode() == CopyMode::Async && !session.is_paused() {
            if !session.copy_data_async() {
                warn!("varserver-core: async copy failed validation, session exiting");
                break;
            }
            copied_this_iteration = true;
        }

        let should_write = !session.is_paused()
            && match session.write_mode() {
                WriteMode::Async => true,
                WriteMode::WhenCopied => copied_this_iteration,
                WriteMode::Promote => false,
            };
        if should_write {
            if let Err(err) = session.write_data() {
                debug!(%err, "varserver-core: worker exiting, connection is terminal");
                break;
            }
        }

        sleep_cancellable(Duration::from_secs_f64(session.update_rate().max(0.0)), cancel);
    }
}

fn sleep_cancellable(total: Duration, cancel: &AtomicBool) {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let step = remaining.min(POLL_GRANULARITY);
        std::thread::sleep(step);
        remaining -= step;
    }
}

fn set_status(status: &(Mutex<ThreadStatus>, Condvar), new: ThreadStatus) {
    let (lock, cvar) = status;
    *lock.lock().unwrap() = new;
    cvar.notify_all();
}
