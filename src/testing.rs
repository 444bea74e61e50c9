//! # Testing
//!
//! Recording stand-ins for the host and for live driver objects.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::host::{
    CodeWriter, HostError, HostInfo, KernelVersion, ModuleId, SymbolResolver, Trampoline,
};
use crate::service::{Service, Value};

/// Locks a spy, ignoring poisoning from a failed assertion on another thread
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Host with a symbol table and flat memory regions. Every call is recorded.
#[derive(Debug)]
pub struct MockHost {
    /// Resolvable symbols
    symbols: HashMap<(ModuleId, String), usize>,
    /// Mapped regions as `(base, bytes)`
    memory: Mutex<Vec<(usize, Vec<u8>)>>,
    /// Routines whose interception fails
    failing_installs: Vec<usize>,
    /// Reported host version
    version: KernelVersion,
    /// Reported board id
    identity: Option<String>,
    /// Reported OS build
    os_build: Option<String>,
    /// Number of symbol lookups
    resolves: AtomicUsize,
    /// `(address, len)` of every read
    reads: Mutex<Vec<(usize, usize)>>,
    /// `(address, bytes)` of every successful write
    writes: Mutex<Vec<(usize, Vec<u8>)>>,
    /// `(routine, hook, trampoline)` of every successful install
    installs: Mutex<Vec<(usize, usize, Trampoline)>>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    /// A High Sierra host with nothing loaded
    pub fn new() -> Self {
        Self {
            symbols: HashMap::new(),
            memory: Mutex::new(Vec::new()),
            failing_installs: Vec::new(),
            version: KernelVersion::HIGH_SIERRA,
            identity: Some("Mac-00BE6ED71E35EB86".to_string()),
            os_build: Some("17G65".to_string()),
            resolves: AtomicUsize::new(0),
            reads: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            installs: Mutex::new(Vec::new()),
        }
    }

    /// Adds a symbol
    pub fn symbol(mut self, module: ModuleId, name: &str, address: usize) -> Self {
        self.symbols.insert((module, name.to_string()), address);
        self
    }

    /// Maps `bytes` at `base`
    pub fn memory(self, base: usize, bytes: &[u8]) -> Self {
        lock(&self.memory).push((base, bytes.to_vec()));
        self
    }

    /// Makes interception of the routine at `address` fail
    pub fn fail_install(mut self, address: usize) -> Self {
        self.failing_installs.push(address);
        self
    }

    /// Sets the reported host version
    pub fn version(mut self, version: KernelVersion) -> Self {
        self.version = version;
        self
    }

    /// Sets the reported board id
    pub fn identity(mut self, identity: Option<&str>) -> Self {
        self.identity = identity.map(str::to_string);
        self
    }

    /// Number of symbol lookups so far
    pub fn resolve_calls(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    /// Every read so far
    pub fn reads(&self) -> Vec<(usize, usize)> {
        lock(&self.reads).clone()
    }

    /// Every write so far
    pub fn writes(&self) -> Vec<(usize, Vec<u8>)> {
        lock(&self.writes).clone()
    }

    /// `(routine, hook)` of every install so far
    pub fn installs(&self) -> Vec<(usize, usize)> {
        lock(&self.installs)
            .iter()
            .map(|(address, hook, _)| (*address, *hook))
            .collect()
    }

    /// Trampoline handed out for the routine at `address`
    pub fn trampoline_for(&self, address: usize) -> Option<Trampoline> {
        lock(&self.installs)
            .iter()
            .find(|(routine, ..)| *routine == address)
            .map(|(.., trampoline)| *trampoline)
    }

    /// Current contents of mapped memory
    pub fn bytes(&self, address: usize, len: usize) -> Option<Vec<u8>> {
        let memory = lock(&self.memory);
        let (base, data) = Self::region(&memory, address, len)?;
        Some(data[address - base..address - base + len].to_vec())
    }

    /// Finds the region holding `address..address + len`
    fn region(memory: &[(usize, Vec<u8>)], address: usize, len: usize) -> Option<(usize, &Vec<u8>)> {
        memory
            .iter()
            .find(|(base, data)| address >= *base && address + len <= base + data.len())
            .map(|(base, data)| (*base, data))
    }
}

impl SymbolResolver for MockHost {
    fn resolve(&self, module: ModuleId, symbol: &str) -> Option<usize> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        self.symbols.get(&(module, symbol.to_string())).copied()
    }

    fn resolve_in(
        &self,
        module: ModuleId,
        symbol: &str,
        address: usize,
        size: usize,
    ) -> Option<usize> {
        self.resolve(module, symbol)
            .filter(|found| (address..address + size).contains(found))
    }
}

impl CodeWriter for MockHost {
    fn read_bytes(&self, address: usize, len: usize) -> Result<Vec<u8>, HostError> {
        lock(&self.reads).push((address, len));
        self.bytes(address, len)
            .ok_or(HostError::Read { address, len })
    }

    fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<(), HostError> {
        let mut memory = lock(&self.memory);
        let (base, data) = memory
            .iter_mut()
            .find(|(base, data)| address >= *base && address + bytes.len() <= *base + data.len())
            .ok_or(HostError::Write {
                address,
                len: bytes.len(),
            })?;
        let start = address - *base;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        lock(&self.writes).push((address, bytes.to_vec()));
        Ok(())
    }

    fn install_transfer(&self, address: usize, hook: usize) -> Result<Trampoline, HostError> {
        if self.failing_installs.contains(&address) {
            return Err(HostError::Route {
                address,
                reason: "refused by test".to_string(),
            });
        }
        let mut installs = lock(&self.installs);
        let trampoline = Trampoline::new(0x7000_0000 + (installs.len() + 1) * 0x100)
            .ok_or(HostError::Route {
                address,
                reason: "null trampoline".to_string(),
            })?;
        installs.push((address, hook, trampoline));
        Ok(trampoline)
    }
}

impl HostInfo for MockHost {
    fn version(&self) -> KernelVersion {
        self.version
    }

    fn identity(&self) -> Option<String> {
        self.identity.clone()
    }

    fn os_build(&self) -> Option<String> {
        self.os_build.clone()
    }
}

/// Driver object backed by two dictionaries
#[derive(Debug, Default, Clone)]
pub struct MockService {
    /// Own properties
    properties: BTreeMap<String, Value>,
    /// Properties of the parent object
    parent: BTreeMap<String, Value>,
    /// Rejects every write
    read_only: bool,
}

impl MockService {
    /// Empty object
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    /// Adds a property to the parent
    pub fn with_parent(mut self, key: &str, value: Value) -> Self {
        self.parent.insert(key.to_string(), value);
        self
    }

    /// Makes every write fail
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Returns `true` if the object has no own properties
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Number of own properties
    pub fn len(&self) -> usize {
        self.properties.len()
    }
}

impl Service for MockService {
    fn property(&self, key: &str) -> Option<Value> {
        self.properties.get(key).cloned()
    }

    fn set_property(&mut self, key: &str, value: Value) -> bool {
        if self.read_only {
            return false;
        }
        self.properties.insert(key.to_string(), value);
        true
    }

    fn remove_property(&mut self, key: &str) {
        self.properties.remove(key);
    }

    fn parent_property(&self, key: &str) -> Option<Value> {
        self.parent.get(key).cloned()
    }
}
