//! The Memory Manager collaborator (spec §1): resolves a variable name to a
//! live address, element type, size, and count. Out of core scope per
//! spec.md; only the lookup/validation interface is modeled here.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{error::ResolveError, value::ValueKind};

/// A resolved binding: the address, type, and array shape of a variable.
#[derive(Clone)]
pub struct Resolution {
    pub address: *const u8,
    pub kind: ValueKind,
}

// SAFETY: `address` points at caller-owned storage that outlives the
// registration (the mock memory manager never frees it while registered);
// references to it are only ever read or written behind the session's copy
// mutex, same as the C++ original's raw-pointer handoff.
unsafe impl Send for Resolution {}
unsafe impl Sync for Resolution {}

/// External collaborator interface the core consumes (spec §1, §9
/// "Back-reference to Memory Manager"). A reference is a relation + lookup,
/// never ownership.
pub trait MemoryManager: Send + Sync {
    /// Resolve `name` (dotted field path, optional constant subscript) to
    /// its live binding.
    fn resolve(&self, name: &str) -> Result<Resolution, ResolveError>;

    /// Re-resolve `name` and confirm it still maps to `expected`'s address
    /// and type/size. Used after a checkpoint restart.
    fn validate(&self, name: &str, expected: &Resolution) -> bool;
}

struct RegisteredVariable {
    ptr: *mut u8,
    kind: ValueKind,
}

// SAFETY: see `Resolution`'s impl above — storage is caller-owned and
// outlives the registration for the lifetime of the test/demo process.
unsafe impl Send for RegisteredVariable {}
unsafe impl Sync for RegisteredVariable {}

/// In-memory stand-in for the simulation's symbolic memory map, backed by a
/// `HashMap<String, RegisteredVariable>` over caller-owned buffers. Used by
/// tests and the CLI demo; not a reasonable substitute for the real
/// simulation executive's reflection tables.
#[derive(Default, Clone)]
pub struct MockMemoryManager {
    inner: Arc<Mutex<HashMap<String, RegisteredVariable>>>,
}

impl MockMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` as bound to `buf`, typed `kind`. `buf` must live at
    /// least as long as any reference resolved against it; callers
    /// typically leak or `Box::leak` a buffer for the life of the process,
    /// matching how a simulation variable outlives the var-server session.
    pub fn register(&self, name: &str, buf: &mut [u8], kind: ValueKind) {
        let mut map = self.inner.lock().unwrap();
        map.insert(name.to_string(), RegisteredVariable { ptr: buf.as_mut_ptr(), kind });
    }

    /// Remove `name`, simulating object destruction. Any outstanding
    /// reference to it will fail `validate()` on its next check.
    pub fn unregister(&self, name: &str) {
        self.inner.lock().unwrap().remove(name);
    }
}

impl MemoryManager for MockMemoryManager {
    fn resolve(&self, name: &str) -> Result<Resolution, ResolveError> {
        let map = self.inner.lock().unwrap();
        let var = map.get(name).ok_or_else(|| ResolveError::NotFound(name.to_string()))?;
        Ok(Resolution { address: var.ptr.cast_const(), kind: var.kind.clone() })
    }

    fn validate(&self, name: &str, expected: &Resolution) -> bool {
        let map = self.inner.lock().unwrap();
        match map.get(name) {
            Some(var) => var.ptr.cast_const() == expected.address && var.kind == expected.kind,
            None => false,
        }
    }
}
