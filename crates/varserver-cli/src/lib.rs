//! A runnable demo wiring a mock memory manager, a ticking executive, and
//! the listener/registry together. Not part of the core: this is the
//! stand-in for the simulation executive's own startup/shutdown hooks,
//! which are an external collaborator from the core's point of view.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::{info, warn};
use varserver_core::{
    executive::ManualExecutive, memory::MockMemoryManager, registry::VariableServer,
    session::VariableServerSession, thread::ThreadStatus, value::ValueKind, SessionLog,
};
use varserver_net::ClientListener;

/// Process startup configuration: session options themselves stay
/// command-driven; this only covers what a process needs before any
/// client has connected.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub bind: SocketAddr,
    pub tic_frequency: f64,
    pub log_path: Option<std::path::PathBuf>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1:7000".parse().unwrap(), tic_frequency: 1000.0, log_path: None }
    }
}

/// A handful of demo variables the executive thread updates every tick, so
/// a freshly connected client has something live to `var_add`.
struct DemoVariables {
    counter: &'static mut [u8],
    sim_time: &'static mut [u8],
    count: i32,
}

fn leak_zeroed(size: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; size].into_boxed_slice())
}

impl DemoVariables {
    fn register(mm: &MockMemoryManager) -> Self {
        let mut counter = leak_zeroed(4);
        mm.register("sim.counter", &mut *counter, ValueKind::Int);
        let mut sim_time = leak_zeroed(8);
        mm.register("sim.time", &mut *sim_time, ValueKind::Double);
        Self { counter, sim_time, count: 0 }
    }

    fn tick(&mut self, seconds: f64) {
        self.count = self.count.wrapping_add(1);
        self.counter.copy_from_slice(&self.count.to_le_bytes());
        self.sim_time.copy_from_slice(&seconds.to_le_bytes());
    }
}

// SAFETY: the leaked buffers are exclusively written by the ticking thread
// that owns `DemoVariables`; the only other reader is `MockMemoryManager`,
// which only ever reads under its own lock while this thread is between
// writes (same single-writer contract `VariableReference::stage_value`
// relies on elsewhere in the crate).
unsafe impl Send for DemoVariables {}

/// Runs the demo server until `shutdown` is set. Blocks the calling thread.
pub fn run(config: DemoConfig, shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    let memory = Arc::new(MockMemoryManager::new());
    let mut demo_vars = DemoVariables::register(&memory);
    let executive = Arc::new(ManualExecutive::new(config.tic_frequency));

    let listener = Arc::new(ClientListener::bind(config.bind)?);
    info!(bind = %listener.local_addr(), "varserver-cli: demo server listening");

    let ticker_shutdown = shutdown.clone();
    let ticker_executive = executive.clone();
    let ticker = std::thread::Builder::new().name("varserver-ticker".to_string()).spawn(move || {
        let tics_per_tick = (ticker_executive.tic_value() / 100.0).max(1.0) as u64;
        while !ticker_shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
            let tics = ticker_executive.advance(tics_per_tick);
            demo_vars.tick(tics as f64 / ticker_executive.tic_value());
            VariableServer::global().copy_data_scheduled(tics);
            VariableServer::global().copy_data_freeze(tics);
        }
    })?;

    let accept_shutdown = shutdown.clone();
    let accept_listener = listener.clone();
    let acceptor = std::thread::Builder::new().name("varserver-acceptor".to_string()).spawn(move || {
        loop {
            if accept_shutdown.load(Ordering::SeqCst) {
                break;
            }
            match accept_listener.accept() {
                Ok((_conn, peer)) if accept_listener.is_stop_signal(peer) => {
                    break;
                }
                Ok((conn, peer)) => {
                    info!(%peer, "varserver-cli: client connected");
                    spawn_client(&memory, &executive, config.log_path.clone(), Box::new(conn));
                }
                Err(err) => {
                    warn!(?err, "varserver-cli: accept failed");
                    break;
                }
            }
        }
    })?;

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(25));
    }
    listener.stop();

    acceptor.join().expect("acceptor thread panicked");
    ticker.join().expect("ticker thread panicked");
    Ok(())
}

fn spawn_client(
    memory: &Arc<MockMemoryManager>,
    executive: &Arc<ManualExecutive>,
    log_path: Option<std::path::PathBuf>,
    connection: Box<dyn varserver_net::ClientConnection>,
) {
    let session = Arc::new(VariableServerSession::new(connection, memory.clone(), executive.clone()));
    if let Some(path) = log_path {
        match SessionLog::open(&path) {
            Ok(sink) => session.enable_logging(sink),
            Err(err) => warn!(?err, "varserver-cli: failed to open session log"),
        }
    }

    let registry = VariableServer::global();
    let id = registry.reserve_id();
    let on_exit = move || VariableServer::global().remove(id);

    let vst = varserver_core::thread::VariableServerThread::spawn(session.clone(), on_exit);
    match vst.wait_for_accept() {
        ThreadStatus::ConnectionSuccess => {
            registry.insert(id, vst, session);
        }
        ThreadStatus::ConnectionFail => {
            warn!("varserver-cli: client handshake failed");
        }
        ThreadStatus::ConnectionPending => unreachable!("wait_for_accept only returns a resolved status"),
    }
}
