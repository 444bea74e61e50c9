//! # Host
//!
//! Interfaces to the environment the engine runs in. The host owns module loading, symbol
//! tables and the ability to change memory protections; the engine only asks questions and
//! requests writes through these traits.

use std::fmt::{self, Display};

use thiserror::Error;

/// Errors reported by the host while touching module memory
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The requested range could not be read
    #[error("unable to read {len} bytes at {address:#x}")]
    Read {
        /// Start of the range
        address: usize,
        /// Length of the range
        len: usize,
    },
    /// The requested range could not be written
    #[error("unable to write {len} bytes at {address:#x}")]
    Write {
        /// Start of the range
        address: usize,
        /// Length of the range
        len: usize,
    },
    /// A transfer could not be installed
    #[error("unable to route {address:#x}: {reason}")]
    Route {
        /// Routine that was being routed
        address: usize,
        /// Host supplied description of the failure
        reason: String,
    },
}

/// Handle the host uses for a loaded module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub usize);

impl ModuleId {
    /// The host's own image
    pub const KERNEL: ModuleId = ModuleId(0);
}

impl Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::KERNEL {
            write!(f, "kernel")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Major version of the running host. Ordering follows release order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion(pub u32);

#[allow(missing_docs)]
impl KernelVersion {
    pub const SNOW_LEOPARD: KernelVersion = KernelVersion(10);
    pub const LION: KernelVersion = KernelVersion(11);
    pub const MOUNTAIN_LION: KernelVersion = KernelVersion(12);
    pub const MAVERICKS: KernelVersion = KernelVersion(13);
    pub const YOSEMITE: KernelVersion = KernelVersion(14);
    pub const EL_CAPITAN: KernelVersion = KernelVersion(15);
    pub const SIERRA: KernelVersion = KernelVersion(16);
    pub const HIGH_SIERRA: KernelVersion = KernelVersion(17);
    pub const MOJAVE: KernelVersion = KernelVersion(18);
}

impl Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed interval of host versions. `None` on either side leaves that side open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    /// Oldest supported version
    pub min: Option<KernelVersion>,
    /// Newest supported version
    pub max: Option<KernelVersion>,
}

impl VersionRange {
    /// Every version
    pub const ANY: VersionRange = VersionRange {
        min: None,
        max: None,
    };

    /// `min` and everything after it
    pub const fn from(min: KernelVersion) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    /// `min..=max`
    pub const fn between(min: KernelVersion, max: KernelVersion) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    /// Checks `version` against both bounds
    pub fn contains(&self, version: KernelVersion) -> bool {
        self.min.map_or(true, |min| version >= min) && self.max.map_or(true, |max| version <= max)
    }
}

/// Address of a callable that behaves like the routine before it was intercepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Trampoline(usize);

impl Trampoline {
    /// Wraps an address. Null addresses are not trampolines.
    pub fn new(address: usize) -> Option<Self> {
        (address != 0).then_some(Self(address))
    }

    /// Address to call
    pub fn address(&self) -> usize {
        self.0
    }
}

/// Symbol lookup inside loaded modules
pub trait SymbolResolver {
    /// Resolves `symbol` inside `module`
    fn resolve(&self, module: ModuleId, symbol: &str) -> Option<usize>;

    /// Resolves `symbol` inside `module`, searching only `address..address + size`
    fn resolve_in(&self, module: ModuleId, symbol: &str, address: usize, size: usize)
        -> Option<usize>;
}

/// Access to module code. Implementations handle any memory protection changes themselves.
pub trait CodeWriter {
    /// Copies `len` bytes from `address`
    fn read_bytes(&self, address: usize, len: usize) -> Result<Vec<u8>, HostError>;

    /// Overwrites `bytes.len()` bytes at `address`
    fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<(), HostError>;

    /// Redirects the routine at `address` to `hook`, returning a trampoline to the original
    /// behaviour. Nothing may be left modified when this fails.
    fn install_transfer(&self, address: usize, hook: usize) -> Result<Trampoline, HostError>;
}

/// Facts about the running host
pub trait HostInfo {
    /// Running host version
    fn version(&self) -> KernelVersion;

    /// Hardware model identity (board id), if known
    fn identity(&self) -> Option<String>;

    /// Build string of the running OS, if known
    fn os_build(&self) -> Option<String>;
}

/// Everything the orchestrator needs from its environment
pub trait Host: SymbolResolver + CodeWriter + HostInfo {}
impl<T: SymbolResolver + CodeWriter + HostInfo> Host for T {}
