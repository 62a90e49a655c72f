//! `VariableServerSession`: per-client state, command handling, and the
//! copy/write algorithms.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use tracing::{debug, warn};
use varserver_net::ClientConnection;

use crate::{
    command::{self, Command, CopyMode, WriteMode},
    error::{ConnectionError, RateError},
    executive::Executive,
    log::SessionLog,
    memory::MemoryManager,
    reference::VariableReference,
    value::FormatOptions,
};

/// `NEW → READY → {RUNNING ↔ PAUSED} → EXITING → CLOSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Ready,
    Running,
    Paused,
    Exiting,
    Closed,
}

/// Minimum representable cycle: `set_update_rate` clamps any non-positive
/// or sub-resolution rate so `cycle_tics >= 1` (`RateError`).
const MIN_CYCLE_TICS: u64 = 1;

/// Fields touched by both the owning worker (async copy/write) and the
/// simulation thread (scheduled copy/freeze copy). Guarded by one mutex so
/// `stageValue` for reference _i_ always happens-before the next
/// `stageValue` for _i_ regardless of which thread calls it.
struct CopyState {
    references: Vec<VariableReference>,
    copy_mode: CopyMode,
    write_mode: WriteMode,
    cycle_tics: u64,
    next_tics: u64,
    freeze_next_tics: u64,
    frame_multiple: u32,
    frame_offset: u32,
    freeze_frame_multiple: u32,
    freeze_frame_offset: u32,
    validate_address: bool,
    binary: bool,
    byteswap: bool,
    binary_data_nonames: bool,
    format_opts: FormatOptions,
}

pub struct VariableServerSession {
    connection: Mutex<Box<dyn ClientConnection>>,
    memory: Arc<dyn MemoryManager>,
    executive: Arc<dyn Executive>,
    copy: Mutex<CopyState>,
    state: Mutex<SessionState>,
    client_tag: Mutex<String>,
    log_sink: Mutex<Option<SessionLog>>,
    update_rate: Mutex<f64>,

    pause: AtomicBool,
    exit: AtomicBool,
    enabled: AtomicBool,
    log_enabled: AtomicBool,
    send_stdio: AtomicBool,
}

impl VariableServerSession {
    pub fn new(
        connection: Box<dyn ClientConnection>,
        memory: Arc<dyn MemoryManager>,
        executive: Arc<dyn Executive>,
    ) -> Self {
        Self {
            connection: Mutex::new(connection),
            memory,
            executive,
            copy: Mutex::new(CopyState {
                references: Vec::new(),
                copy_mode: CopyMode::Async,
                write_mode: WriteMode::Async,
                cycle_tics: MIN_CYCLE_TICS,
                next_tics: 0,
                freeze_next_tics: 0,
                frame_multiple: 1,
                frame_offset: 0,
                freeze_frame_multiple: 1,
                freeze_frame_offset: 0,
                validate_address: false,
                binary: false,
                byteswap: false,
                binary_data_nonames: false,
                format_opts: FormatOptions::default(),
            }),
            state: Mutex::new(SessionState::New),
            client_tag: Mutex::new(String::new()),
            log_sink: Mutex::new(None),
            update_rate: Mutex::new(0.1),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn mark_ready(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Ready);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Sets the pause flag directly, bypassing command dispatch/logging.
    /// Used by [`crate::registry::VariableServer`]'s checkpoint-restart
    /// coupling to force every session paused for the duration of a
    /// restart and restore its prior state afterward.
    pub fn set_paused(&self, paused: bool) {
        self.pause.store(paused, Ordering::SeqCst);
        self.set_state(if paused { SessionState::Paused } else { SessionState::Running });
    }

    pub fn get_exit_cmd(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    pub fn copy_mode(&self) -> CopyMode {
        self.copy.lock().unwrap().copy_mode
    }

    pub fn write_mode(&self) -> WriteMode {
        self.copy.lock().unwrap().write_mode
    }

    pub fn update_rate(&self) -> f64 {
        *self.update_rate.lock().unwrap()
    }

    pub fn client_tag(&self) -> String {
        self.client_tag.lock().unwrap().clone()
    }

    /// Sole contract exposed to the scheduler: `None` stands in for `+∞`
    /// so a disabled or non-scheduled session is never picked by
    /// `VariableServer::get_next_tics`.
    pub fn get_next_tics(&self) -> Option<u64> {
        if !self.enabled.load(Ordering::SeqCst) {
            return None;
        }
        let st = self.copy.lock().unwrap();
        (st.copy_mode == CopyMode::Scheduled).then_some(st.next_tics)
    }

    pub fn get_freeze_next_tics(&self) -> Option<u64> {
        if !self.enabled.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.copy.lock().unwrap().freeze_next_tics)
    }

    /// Called by the worker thread's loop when `copy_mode == Async`.
    /// Fails only if a reference is invalid and address validation is on.
    pub fn copy_data_async(&self) -> bool {
        let mut st = self.copy.lock().unwrap();
        stage_all(&mut st)
    }

    /// Called by the simulation thread on ticks matching `next_tics`.
    pub fn copy_data_scheduled(&self, current_tics: u64) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return true;
        }
        let mut st = self.copy.lock().unwrap();
        if st.copy_mode != CopyMode::Scheduled || current_tics < st.next_tics {
            return true;
        }
        let ok = stage_all(&mut st);
        st.next_tics += st.cycle_tics.max(MIN_CYCLE_TICS);
        ok
    }

    /// Called by the simulation thread on ticks matching `freeze_next_tics`,
    /// independent of `copy_mode` — freeze telemetry stays alive while the
    /// simulation itself is paused.
    pub fn copy_data_freeze(&self, current_tics: u64) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return true;
        }
        let mut st = self.copy.lock().unwrap();
        if current_tics < st.freeze_next_tics {
            return true;
        }
        let ok = stage_all(&mut st);
        st.freeze_next_tics += st.cycle_tics.max(MIN_CYCLE_TICS);
        ok
    }

    /// Called once per major frame before any scheduled jobs.
    pub fn copy_data_top_of_frame(&self) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return true;
        }
        let mut st = self.copy.lock().unwrap();
        if st.copy_mode != CopyMode::TopOfFrame {
            return true;
        }
        stage_all(&mut st)
    }

    /// For each reference, promotes staged data to write-ready; if at least
    /// one becomes ready, emits one frame preceded by a message-id header.
    /// Returns `Err` on send failure — the thread treats that as terminal.
    pub fn write_data(&self) -> Result<(), ConnectionError> {
        let mut st = self.copy.lock().unwrap();
        let mut any_ready = false;
        for r in &mut st.references {
            r.prepare_for_write();
            any_ready |= r.is_write_ready();
        }
        if !any_ready {
            return Ok(());
        }

        let frame = if st.binary {
            encode_binary_frame(&mut st.references, st.byteswap, st.binary_data_nonames)
        } else {
            let time = self.executive.current_seconds();
            encode_ascii_frame(&mut st.references, time, st.format_opts)
        };
        drop(st);

        let mut conn = self.connection.lock().unwrap();
        conn.write(&frame).map(|_| ()).map_err(|err| {
            warn!(?err, "varserver-core: write_data failed, session is terminal");
            ConnectionError::Transport(err)
        })
    }

    /// Reads one command from the connection and dispatches it. Returns
    /// `Err` on peer close (thread treats as terminal). A parse failure
    /// replies with a diagnostic frame and returns `Ok(())`.
    pub fn handle_message(&self) -> Result<(), ConnectionError> {
        let outcome = {
            let mut conn = self.connection.lock().unwrap();
            conn.read()
        };
        let line = match outcome {
            Ok(varserver_net::ReadOutcome::Line(line)) => line,
            Ok(varserver_net::ReadOutcome::NoData) => return Ok(()),
            Ok(varserver_net::ReadOutcome::Closed) => return Err(ConnectionError::PeerClosed),
            Err(err) => {
                warn!(?err, "varserver-core: connection read failed");
                return Err(ConnectionError::Transport(err));
            }
        };
        if line.trim().is_empty() {
            return Ok(());
        }

        match command::parse(&line) {
            Ok(cmd) => {
                let outcome = self.execute(cmd);
                self.log_command(&line, if outcome.is_ok() { "ok" } else { "error" });
            }
            // Unknown commands are silently ignored (spec §6); only a
            // recognized command with a malformed argument list gets a
            // diagnostic frame.
            Err(err @ crate::error::ParseError::UnknownCommand(_)) => {
                debug!(%err, command = %line, "varserver-core: unknown command ignored");
                self.log_command(&line, "unknown_command");
            }
            Err(err) => {
                debug!(%err, command = %line, "varserver-core: command parse error");
                self.send_diagnostic(&err.to_string());
                self.log_command(&line, "parse_error");
            }
        }
        Ok(())
    }

    pub(crate) fn execute(&self, cmd: Command) -> Result<(), String> {
        match cmd {
            Command::Add { name, units } => self.cmd_add(&name, units),
            Command::Remove { name } => {
                self.copy.lock().unwrap().references.retain(|r| r.name() != name);
                Ok(())
            }
            Command::Exit => {
                self.exit.store(true, Ordering::SeqCst);
                self.disconnect_references();
                self.set_state(SessionState::Exiting);
                Ok(())
            }
            Command::Units { name, units } => {
                let mut st = self.copy.lock().unwrap();
                if let Some(r) = st.references.iter_mut().find(|r| r.name() == name) {
                    r.set_units(units);
                }
                Ok(())
            }
            Command::Send => {
                {
                    let mut st = self.copy.lock().unwrap();
                    for r in &mut st.references {
                        r.stage_value();
                        r.prepare_for_write();
                    }
                }
                self.write_data().map_err(|err| err.to_string())
            }
            Command::Pause => {
                self.set_paused(true);
                Ok(())
            }
            Command::Unpause => {
                self.set_paused(false);
                Ok(())
            }
            Command::SetCopyMode(mode) => {
                self.copy.lock().unwrap().copy_mode = mode;
                Ok(())
            }
            Command::SetWriteMode(mode) => {
                self.copy.lock().unwrap().write_mode = mode;
                Ok(())
            }
            Command::SetFrameMultiple(n) => {
                self.copy.lock().unwrap().frame_multiple = n.max(1);
                Ok(())
            }
            Command::SetFrameOffset(k) => {
                self.copy.lock().unwrap().frame_offset = k;
                Ok(())
            }
            Command::SetFreezeFrameMultiple(n) => {
                self.copy.lock().unwrap().freeze_frame_multiple = n.max(1);
                Ok(())
            }
            Command::SetFreezeFrameOffset(k) => {
                self.copy.lock().unwrap().freeze_frame_offset = k;
                Ok(())
            }
            Command::SetUpdateRate(seconds) => {
                self.set_update_rate(seconds);
                Ok(())
            }
            Command::SetBinaryFormat { on, nonames } => {
                let mut st = self.copy.lock().unwrap();
                st.binary = on;
                st.binary_data_nonames = nonames;
                Ok(())
            }
            Command::SetByteswap(on) => {
                self.copy.lock().unwrap().byteswap = on;
                Ok(())
            }
            Command::ValidateAddress(on) => {
                self.copy.lock().unwrap().validate_address = on;
                Ok(())
            }
            Command::SetLog(on) => {
                self.log_enabled.store(on, Ordering::SeqCst);
                Ok(())
            }
            Command::SetSendStdio(on) => {
                self.send_stdio.store(on, Ordering::SeqCst);
                Ok(())
            }
            Command::VarList => {
                let st = self.copy.lock().unwrap();
                let names: Vec<&str> = st.references.iter().map(VariableReference::name).collect();
                drop(st);
                let mut conn = self.connection.lock().unwrap();
                let line = format!("2\t{}\n", names.join(","));
                conn.write(line.as_bytes()).map(|_| ()).map_err(|err| err.to_string())
            }
            Command::SetClientTag(tag) => {
                *self.client_tag.lock().unwrap() = tag;
                Ok(())
            }
            Command::SendSie(slice) => self.send_sie(&slice),
        }
    }

    /// Emits one message-id-1 frame describing the requested slice of
    /// introspection metadata. The core has no SIE host to query — that's
    /// an external collaborator — so it reports the shape it does own —
    /// each subscribed reference's name, wire type tag, and units — which
    /// is the only introspection data this crate is in a position to
    /// answer authoritatively for.
    fn send_sie(&self, slice: &str) -> Result<(), String> {
        let st = self.copy.lock().unwrap();
        let mut out = format!("1\t{slice}");
        for r in &st.references {
            out.push('\t');
            out.push_str(&format!("{}:{}:{}", r.name(), r.kind().type_tag(), r.units()));
        }
        drop(st);
        out.push('\n');
        let mut conn = self.connection.lock().unwrap();
        conn.write(out.as_bytes()).map(|_| ()).map_err(|err| err.to_string())
    }

    /// Mirrors `text` to the client as a message-id-5 stdio-mirror frame
    /// when the session's `send_stdio` flag is enabled; a no-op otherwise.
    /// The simulation's own stdout/stderr capture is an external
    /// collaborator; this is the sink it would write through.
    pub fn mirror_stdio(&self, text: &str) -> Result<(), ConnectionError> {
        if !self.send_stdio.load(Ordering::SeqCst) {
            return Ok(());
        }
        let line = format!("5\t{text}\n");
        let mut conn = self.connection.lock().unwrap();
        conn.write(line.as_bytes()).map(|_| ()).map_err(|err| {
            warn!(?err, "varserver-core: stdio mirror write failed");
            ConnectionError::Transport(err)
        })
    }

    fn cmd_add(&self, name: &str, units: Option<String>) -> Result<(), String> {
        let mut st = self.copy.lock().unwrap();
        if st.references.iter().any(|r| r.name() == name) {
            return Ok(());
        }
        match VariableReference::resolve(name, self.memory.clone(), units.unwrap_or_default()) {
            Ok(r) => {
                st.references.push(r);
                Ok(())
            }
            Err(err) => {
                drop(st);
                self.send_diagnostic(&err.to_string());
                Err(err.to_string())
            }
        }
    }

    /// `cycle_tics = round(seconds * tic_value)`, clamped to `>= 1`
    /// (`RateError`).
    pub fn set_update_rate(&self, seconds: f64) {
        let mut rate = self.update_rate.lock().unwrap();
        let clamped = if seconds <= 0.0 {
            warn!(
                error = %RateError::NonPositive,
                requested = seconds,
                "varserver-core: set_update_rate clamped"
            );
            f64::EPSILON
        } else {
            seconds
        };
        *rate = clamped;
        let tic_value = self.executive.tic_value();
        let cycle_tics = (clamped * tic_value).round().max(MIN_CYCLE_TICS as f64) as u64;
        self.copy.lock().unwrap().cycle_tics = cycle_tics;
    }

    pub fn enable_logging(&self, sink: SessionLog) {
        *self.log_sink.lock().unwrap() = Some(sink);
        self.log_enabled.store(true, Ordering::SeqCst);
    }

    fn log_command(&self, command_text: &str, outcome: &str) {
        if !self.log_enabled.load(Ordering::SeqCst) {
            return;
        }
        let tag = self.client_tag();
        if let Some(sink) = self.log_sink.lock().unwrap().as_mut() {
            sink.record(&tag, command_text, outcome);
        }
    }

    fn send_diagnostic(&self, message: &str) {
        let mut conn = self.connection.lock().unwrap();
        let line = format!("3\t{message}\n");
        let _ = conn.write(line.as_bytes());
    }

    /// Marks every reference invalid so a concurrent scheduled copy cannot
    /// chase freed memory once the session enters `EXITING`.
    pub fn disconnect_references(&self) {
        let mut st = self.copy.lock().unwrap();
        for r in &mut st.references {
            r.disconnect();
        }
    }

    /// Re-resolves every reference after a checkpoint restart.
    pub fn revalidate_references(&self) {
        let mut st = self.copy.lock().unwrap();
        for r in &mut st.references {
            r.revalidate_after_restart();
        }
    }

    pub fn reference_count(&self) -> usize {
        self.copy.lock().unwrap().references.len()
    }

    pub fn close(&self) {
        self.set_state(SessionState::Closed);
        self.connection.lock().unwrap().disconnect();
    }

    /// Brings up the underlying connection. The owning thread transitions
    /// to `CONNECTION_SUCCESS` only after this returns `Ok`.
    pub fn start_connection(&self) -> Result<(), ConnectionError> {
        self.connection.lock().unwrap().start().map_err(|err| {
            warn!(?err, "varserver-core: connection handshake failed");
            ConnectionError::HandshakeFailed
        })
    }
}

fn stage_all(st: &mut CopyState) -> bool {
    let validate = st.validate_address;
    let mut ok = true;
    for r in &mut st.references {
        if validate && !r.validate() {
            ok = false;
            continue;
        }
        r.stage_value();
    }
    ok
}

fn encode_ascii_frame(references: &mut [VariableReference], time: f64, opts: FormatOptions) -> Vec<u8> {
    let mut out = format!("0\t{time}");
    for r in references {
        if let Some(text) = r.write_value_ascii(opts) {
            out.push('\t');
            out.push_str(&text);
        }
    }
    out.push('\n');
    out.into_bytes()
}

fn encode_binary_frame(references: &mut [VariableReference], byteswap: bool, nonames: bool) -> Vec<u8> {
    let mut body = Vec::new();
    let mut num_vars: u32 = 0;
    for r in references.iter_mut() {
        if !r.is_write_ready() {
            continue;
        }
        num_vars += 1;
        if !nonames {
            let name = r.name().as_bytes();
            body.extend_from_slice(&(name.len() as u32).to_le_bytes());
            body.extend_from_slice(name);
        }
        let kind = r.kind().clone();
        body.extend_from_slice(&kind.type_tag().to_le_bytes());
        body.extend_from_slice(&(kind.byte_size() as u32).to_le_bytes());
        r.write_value_binary(byteswap, &mut body);
    }

    let mut out = Vec::with_capacity(body.len() + 12);
    out.extend_from_slice(&0u32.to_le_bytes());
    let msg_len = (4 + body.len()) as u32;
    out.extend_from_slice(&msg_len.to_le_bytes());
    out.extend_from_slice(&num_vars.to_le_bytes());
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use varserver_net::MockClientConnection;

    use super::*;
    use crate::{memory::MockMemoryManager, value::ValueKind};

    fn build_session() -> (Arc<VariableServerSession>, MockMemoryManager, Arc<ManualExecutive>) {
        let memory = MockMemoryManager::new();
        let executive = Arc::new(ManualExecutive::new(1000.0));
        let session = Arc::new(VariableServerSession::new(
            Box::new(MockClientConnection::new()),
            Arc::new(memory.clone()),
            executive.clone(),
        ));
        session.mark_ready();
        (session, memory, executive)
    }

    use crate::executive::ManualExecutive;

    #[test]
    fn add_then_send_emits_current_value() {
        let (session, memory, _exec) = build_session();
        let mut buf = 5i32.to_le_bytes();
        memory.register("x", &mut buf, ValueKind::Int);

        session.execute(Command::Add { name: "x".to_string(), units: None }).unwrap();
        assert_eq!(session.reference_count(), 1);
        session.execute(Command::Send).unwrap();
    }

    #[test]
    fn unresolvable_add_sends_diagnostic_and_is_not_inserted() {
        let (session, _memory, _exec) = build_session();
        assert!(session.execute(Command::Add { name: "nope".to_string(), units: None }).is_err());
        assert_eq!(session.reference_count(), 0);
    }

    #[test]
    fn exit_disconnects_references() {
        let (session, memory, _exec) = build_session();
        let mut buf = 5i32.to_le_bytes();
        memory.register("x", &mut buf, ValueKind::Int);
        session.execute(Command::Add { name: "x".to_string(), units: None }).unwrap();
        session.execute(Command::Exit).unwrap();
        assert!(session.get_exit_cmd());
        assert_eq!(session.state(), SessionState::Exiting);
    }

    #[test]
    fn scheduled_copy_advances_next_tics_by_cycle() {
        let (session, memory, exec) = build_session();
        let mut buf = 5i32.to_le_bytes();
        memory.register("x", &mut buf, ValueKind::Int);
        session.execute(Command::Add { name: "x".to_string(), units: None }).unwrap();
        session.execute(Command::SetCopyMode(CopyMode::Scheduled)).unwrap();
        session.set_update_rate(0.01);

        let before = session.get_next_tics().unwrap();
        exec.advance(10);
        session.copy_data_scheduled(exec.current_tics());
        let after = session.get_next_tics().unwrap();
        assert!(after > before);
    }

    #[test]
    fn send_sie_emits_message_id_one_with_requested_slice() {
        let (session, memory, _exec) = build_session();
        let mut buf = 5i32.to_le_bytes();
        memory.register("x", &mut buf, ValueKind::Int);
        session.execute(Command::Add { name: "x".to_string(), units: Some("count".to_string()) }).unwrap();

        session.execute(Command::SendSie("class".to_string())).unwrap();
    }

    #[test]
    fn mirror_stdio_is_noop_until_enabled() {
        let (session, _memory, _exec) = build_session();
        session.mirror_stdio("hello from sim").unwrap();
        session.execute(Command::SetSendStdio(true)).unwrap();
        session.mirror_stdio("hello again").unwrap();
    }

    #[test]
    fn pause_stops_write_while_unpause_resumes() {
        let (session, memory, _exec) = build_session();
        let mut buf = 5i32.to_le_bytes();
        memory.register("x", &mut buf, ValueKind::Int);
        session.execute(Command::Add { name: "x".to_string(), units: None }).unwrap();

        session.execute(Command::Pause).unwrap();
        assert!(session.is_paused());
        session.execute(Command::Unpause).unwrap();
        assert!(!session.is_paused());
    }
}
