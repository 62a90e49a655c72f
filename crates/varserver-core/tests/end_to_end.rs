//! End-to-end scenarios S1-S6 (spec.md §8), driven through the public
//! session API and the mock transport/memory manager.

use std::sync::Arc;

use varserver_core::{
    executive::ManualExecutive,
    memory::MockMemoryManager,
    registry::VariableServer,
    session::{SessionState, VariableServerSession},
    thread::{ThreadStatus, VariableServerThread},
    value::ValueKind,
};
use varserver_net::{ClientConnection, MockClientConnection, MockConnectionHandle, NetError, ReadOutcome};

fn build(memory: &MockMemoryManager) -> (Arc<VariableServerSession>, MockConnectionHandle) {
    let executive = Arc::new(ManualExecutive::new(1000.0));
    let (conn, handle) = MockClientConnection::pair();
    let session = Arc::new(VariableServerSession::new(Box::new(conn), Arc::new(memory.clone()), executive));
    session.mark_ready();
    (session, handle)
}

fn only_frame(handle: &MockConnectionHandle) -> String {
    let frames = handle.take_written();
    assert_eq!(frames.len(), 1, "expected exactly one frame, got {frames:?}");
    String::from_utf8(frames[0].clone()).unwrap()
}

/// S1: subscribe/read int.
#[test]
fn s1_subscribe_and_read_int() {
    let memory = MockMemoryManager::new();
    let mut buf = 5i32.to_le_bytes();
    memory.register("x", &mut buf, ValueKind::Int);
    let (session, handle) = build(&memory);

    handle.push_command("trick.var_add(\"x\")");
    session.handle_message().unwrap();
    handle.push_command("trick.var_send()");
    session.handle_message().unwrap();

    assert_eq!(only_frame(&handle), "0\t0\t5\n");
}

/// S2: array.
#[test]
fn s2_array_reply_is_comma_separated() {
    let memory = MockMemoryManager::new();
    let mut buf = Vec::new();
    for v in [1i32, 2, 3, 4, 5] {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    memory.register("a", &mut buf, ValueKind::Array(Box::new(ValueKind::Int), 5));
    let (session, handle) = build(&memory);

    handle.push_command("trick.var_add(\"a\")");
    session.handle_message().unwrap();
    handle.push_command("trick.var_send()");
    session.handle_message().unwrap();

    assert_eq!(only_frame(&handle), "0\t0\t1,2,3,4,5\n");
}

/// S3: string escapes. An `unsigned char` array formats as one contiguous
/// run with non-printables escaped, truncated at the first NUL.
#[test]
fn s3_string_escapes() {
    let memory = MockMemoryManager::new();
    let mut buf = b"\n\t\x08\x07\"\x0c\r\x0b\0".to_vec();
    let len = buf.len();
    memory.register("s", &mut buf, ValueKind::Array(Box::new(ValueKind::UnsignedChar), len));
    let (session, handle) = build(&memory);

    handle.push_command("trick.var_add(\"s\")");
    session.handle_message().unwrap();
    handle.push_command("trick.var_send()");
    session.handle_message().unwrap();

    assert_eq!(only_frame(&handle), "0\t0\t\\n\\t\\b\\a\"\\f\\r\\v\n");
}

/// A `char` array, by contrast, prints raw with no escaping at all — only
/// the NUL terminator stops the run.
#[test]
fn s3_char_array_prints_raw_and_truncates_at_nul() {
    let memory = MockMemoryManager::new();
    let mut buf = b"jackie\0".to_vec();
    let len = buf.len();
    memory.register("name", &mut buf, ValueKind::Array(Box::new(ValueKind::Char), len));
    let (session, handle) = build(&memory);

    handle.push_command("trick.var_add(\"name\")");
    session.handle_message().unwrap();
    handle.push_command("trick.var_send()");
    session.handle_message().unwrap();

    assert_eq!(only_frame(&handle), "0\t0\tjackie\n");
}

/// S3 (string variant): a dynamic `String` value escapes as one run,
/// matching spec §4.1's "string (dynamic)" formatting rule directly.
#[test]
fn s3_dynamic_string_escapes_as_one_run() {
    let memory = MockMemoryManager::new();
    let mut buf = b"\n\t\x08\x07\"\x0c\r\x0b\0".to_vec();
    memory.register("s", &mut buf, ValueKind::String);
    let (session, handle) = build(&memory);

    handle.push_command("trick.var_add(\"s\")");
    session.handle_message().unwrap();
    handle.push_command("trick.var_send()");
    session.handle_message().unwrap();

    assert_eq!(only_frame(&handle), "0\t0\t\\n\\t\\b\\a\"\\f\\r\\v\n");
}

/// S4: exit disconnects the session and the registry forgets it.
#[test]
fn s4_exit_closes_session_and_forgets_registry_entry() {
    let memory = MockMemoryManager::new();
    let mut buf = 5i32.to_le_bytes();
    memory.register("x", &mut buf, ValueKind::Int);
    let (session, handle) = build(&memory);

    let registry = VariableServer::new();
    let id = registry.reserve_id();
    let registry_for_exit = Arc::new(registry);
    let removal_registry = registry_for_exit.clone();
    let vst = VariableServerThread::spawn(session.clone(), move || removal_registry.remove(id));
    assert_eq!(vst.wait_for_accept(), ThreadStatus::ConnectionSuccess);
    registry_for_exit.insert(id, vst.clone(), session.clone());
    assert_eq!(registry_for_exit.session_count(), 1);

    handle.push_command("trick.var_add(\"x\")");
    handle.push_command("trick.var_exit()");
    vst.join();

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(registry_for_exit.session_count(), 0);
    assert!(registry_for_exit.get_session(id).is_none());
}

/// A connection whose handshake always fails.
struct FailingConnection;

impl ClientConnection for FailingConnection {
    fn start(&mut self) -> Result<(), NetError> {
        Err(NetError::Closed)
    }
    fn disconnect(&mut self) {}
    fn read(&mut self) -> Result<ReadOutcome, NetError> {
        Ok(ReadOutcome::NoData)
    }
    fn write(&mut self, bytes: &[u8]) -> Result<usize, NetError> {
        Ok(bytes.len())
    }
    fn restart(&mut self) -> Result<(), NetError> {
        Ok(())
    }
    fn set_client_tag(&mut self, _tag: String) {}
    fn client_tag(&self) -> &str {
        ""
    }
    fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }
}

/// S5: handshake failure never registers a session.
#[test]
fn s5_handshake_failure_yields_connection_fail_and_no_registration() {
    let memory = MockMemoryManager::new();
    let executive = Arc::new(ManualExecutive::new(1000.0));
    let session =
        Arc::new(VariableServerSession::new(Box::new(FailingConnection), Arc::new(memory), executive));

    let registry = VariableServer::new();
    let id = registry.reserve_id();
    let vst = VariableServerThread::spawn(session.clone(), || {});

    assert_eq!(vst.wait_for_accept(), ThreadStatus::ConnectionFail);
    // Per spec §4.5, the caller observing `ConnectionFail` must not
    // reference the session; it simply never registers it.
    assert_eq!(registry.get_session(id), None);
    assert_eq!(registry.session_count(), 0);
    vst.join();
}

/// S6: pause suppresses frames; unpause resumes them.
#[test]
fn s6_pause_suppresses_frames_unpause_resumes() {
    let memory = MockMemoryManager::new();
    let mut buf = 5i32.to_le_bytes();
    memory.register("x", &mut buf, ValueKind::Int);
    let (session, handle) = build(&memory);

    handle.push_command("trick.var_pause()");
    session.handle_message().unwrap();
    handle.push_command("trick.var_add(\"x\")");
    session.handle_message().unwrap();

    // Ten simulated cycles of the async copy/write path while paused.
    for _ in 0..10 {
        if !session.is_paused() {
            session.copy_data_async();
        }
        if !session.is_paused() {
            session.write_data().unwrap();
        }
    }
    assert!(handle.take_written().is_empty());

    handle.push_command("trick.var_unpause()");
    session.handle_message().unwrap();
    handle.push_command("trick.var_send()");
    session.handle_message().unwrap();

    assert_eq!(only_frame(&handle), "0\t0\t5\n");
}

/// Invariant 1 (spec §8): `next_tics` never regresses for an enabled,
/// unpaused, scheduled session.
#[test]
fn invariant_next_tics_is_monotonic() {
    let memory = MockMemoryManager::new();
    let mut buf = 5i32.to_le_bytes();
    memory.register("x", &mut buf, ValueKind::Int);
    let (session, handle) = build(&memory);

    handle.push_command("trick.var_add(\"x\")");
    session.handle_message().unwrap();
    handle.push_command("trick.var_set_copy_mode(1)");
    session.handle_message().unwrap();
    session.set_update_rate(0.01);

    let mut last = session.get_next_tics().unwrap();
    for tics in (10..=200).step_by(10) {
        session.copy_data_scheduled(tics);
        let next = session.get_next_tics().unwrap();
        assert!(next >= last);
        last = next;
    }
}

/// `send_sie_*` emits a message-id 1 frame naming the requested slice,
/// listing each subscribed reference's name/type tag/units (spec §6).
#[test]
fn send_sie_reports_subscribed_reference_metadata() {
    let memory = MockMemoryManager::new();
    let mut buf = 5i32.to_le_bytes();
    memory.register("x", &mut buf, ValueKind::Int);
    let (session, handle) = build(&memory);

    handle.push_command("trick.var_add(\"x\", \"count\")");
    session.handle_message().unwrap();
    handle.push_command("trick.var_send_sie_class()");
    session.handle_message().unwrap();

    let frame = only_frame(&handle);
    assert!(frame.starts_with("1\tclass\t"));
    assert!(frame.contains("x:6:count"));
}

/// `send_stdio(on)` gates the message-id 5 mirror frame; disabled by
/// default (spec §6).
#[test]
fn mirror_stdio_is_gated_by_send_stdio_flag() {
    let memory = MockMemoryManager::new();
    let (session, handle) = build(&memory);

    session.mirror_stdio("printf output").unwrap();
    assert!(handle.take_written().is_empty());

    handle.push_command("trick.var_send_stdio(1)");
    session.handle_message().unwrap();
    session.mirror_stdio("printf output").unwrap();
    assert_eq!(only_frame(&handle), "5\tprintf output\n");
}

/// Invariant 5 (spec §8): once a session is `EXITING`, further scheduled
/// copies on it are no-ops (its references are disconnected, so any
/// leftover scheduled call simply finds invalid, already-sentinel refs).
#[test]
fn invariant_exiting_session_ignores_further_scheduled_copies() {
    let memory = MockMemoryManager::new();
    let mut buf = 5i32.to_le_bytes();
    memory.register("x", &mut buf, ValueKind::Int);
    let (session, handle) = build(&memory);

    handle.push_command("trick.var_add(\"x\")");
    session.handle_message().unwrap();
    handle.push_command("trick.var_exit()");
    session.handle_message().unwrap();

    assert_eq!(session.state(), SessionState::Exiting);
    assert!(session.copy_data_scheduled(1_000_000));
    assert_eq!(session.reference_count(), 1);
}

/// Binary reply framing (spec §6): `[msg_id=0][msg_len][num_vars]` followed
/// by one named, typed, length-prefixed record per subscribed variable.
#[test]
fn binary_frame_has_size_prefixed_header_and_named_record() {
    let memory = MockMemoryManager::new();
    let mut buf = 5i32.to_le_bytes();
    memory.register("x", &mut buf, ValueKind::Int);
    let (session, handle) = build(&memory);

    handle.push_command("trick.var_set_binary_format(1, 0)");
    session.handle_message().unwrap();
    handle.push_command("trick.var_add(\"x\")");
    session.handle_message().unwrap();
    handle.push_command("trick.var_send()");
    session.handle_message().unwrap();

    let frames = handle.take_written();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];

    let msg_id = u32::from_le_bytes(frame[0..4].try_into().unwrap());
    let msg_len = u32::from_le_bytes(frame[4..8].try_into().unwrap());
    let num_vars = u32::from_le_bytes(frame[8..12].try_into().unwrap());
    assert_eq!(msg_id, 0);
    assert_eq!(msg_len as usize, frame.len() - 8);
    assert_eq!(num_vars, 1);

    let name_len = u32::from_le_bytes(frame[12..16].try_into().unwrap()) as usize;
    assert_eq!(name_len, 1);
    let name = &frame[16..16 + name_len];
    assert_eq!(name, b"x");
    let type_tag = u32::from_le_bytes(frame[17..21].try_into().unwrap());
    let byte_size = u32::from_le_bytes(frame[21..25].try_into().unwrap());
    assert_eq!(type_tag, ValueKind::Int.type_tag());
    assert_eq!(byte_size, 4);
    let value = i32::from_le_bytes(frame[25..29].try_into().unwrap());
    assert_eq!(value, 5);
    assert_eq!(frame.len(), 29);
}

/// `binary_data_nonames` (spec §6) omits the name field entirely, trusting
/// the client to have subscribed by position.
#[test]
fn binary_frame_omits_names_when_nonames_is_set() {
    let memory = MockMemoryManager::new();
    let mut buf = 5i32.to_le_bytes();
    memory.register("x", &mut buf, ValueKind::Int);
    let (session, handle) = build(&memory);

    handle.push_command("trick.var_set_binary_format(1, 1)");
    session.handle_message().unwrap();
    handle.push_command("trick.var_add(\"x\")");
    session.handle_message().unwrap();
    handle.push_command("trick.var_send()");
    session.handle_message().unwrap();

    let frames = handle.take_written();
    let frame = &frames[0];
    // header (12) + type_tag (4) + byte_size (4) + value (4), no name field.
    assert_eq!(frame.len(), 24);
    let type_tag = u32::from_le_bytes(frame[12..16].try_into().unwrap());
    let byte_size = u32::from_le_bytes(frame[16..20].try_into().unwrap());
    let value = i32::from_le_bytes(frame[20..24].try_into().unwrap());
    assert_eq!(type_tag, ValueKind::Int.type_tag());
    assert_eq!(byte_size, 4);
    assert_eq!(value, 5);
}
