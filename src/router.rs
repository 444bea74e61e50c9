//! # Router
//!
//! Symbol interception. A routine is resolved inside a module, a transfer to a hook is installed,
//! and the trampoline to the original behaviour is recorded for the hook to call.
//!
//! Hooks are plain `extern` routines living in the embedding glue. They find the trampoline for
//! their own [`HookKind`] through the [`Registry`] of the orchestrator that installed them.

use std::fmt::{self, Display};
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::host::{CodeWriter, ModuleId, SymbolResolver, Trampoline};

/// Every routine the engine knows how to intercept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// `_csfg_get_platform_binary` in the kernel
    PlatformBinary,
    /// `AppleGraphicsDevicePolicy::start`
    AgdpStart,
    /// `nvAccelerator::SetAccelProperties` in the bundled driver
    SetAccelProperties,
    /// `nvAcceleratorParent::SetAccelProperties` in the web driver
    SetAccelPropertiesWeb,
    /// `NVDAStartupWeb::probe`
    NvdaStartupProbe,
    /// The `PreSubmit` call inside the bundled driver's fifo `Prepare`
    PreSubmit,
    /// The `PreSubmit` call inside the web driver's fifo `Prepare`
    PreSubmitWeb,
}

impl HookKind {
    /// Number of kinds
    pub const COUNT: usize = 7;

    /// Every kind
    pub const ALL: [HookKind; HookKind::COUNT] = [
        HookKind::PlatformBinary,
        HookKind::AgdpStart,
        HookKind::SetAccelProperties,
        HookKind::SetAccelPropertiesWeb,
        HookKind::NvdaStartupProbe,
        HookKind::PreSubmit,
        HookKind::PreSubmitWeb,
    ];

    /// Slot of this kind inside the registry
    fn index(self) -> usize {
        self as usize
    }
}

impl Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Addresses of the hook routines, supplied by the embedding glue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookAddresses([Option<usize>; HookKind::COUNT]);

impl HookAddresses {
    /// No hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the routine that `kind` is routed to
    pub fn with(mut self, kind: HookKind, hook: usize) -> Self {
        self.0[kind.index()] = (hook != 0).then_some(hook);
        self
    }

    /// Routine that `kind` is routed to
    pub fn get(&self, kind: HookKind) -> Option<usize> {
        self.0[kind.index()]
    }
}

/// Where an interception was installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Site {
    /// Module containing the routine
    pub module: ModuleId,
    /// Name of the routine, or of the routine containing the call site
    pub symbol: &'static str,
}

/// A hook and the state of its interception
#[derive(Debug, Default)]
pub struct InterceptionRecord {
    /// Routine the interception transfers to
    hook: Option<usize>,
    /// Set together with `trampoline`
    site: OnceLock<Site>,
    /// Original behaviour; only ever set after a successful install
    trampoline: OnceLock<Trampoline>,
}

impl InterceptionRecord {
    /// Hook routine, if the glue supplied one
    pub fn hook(&self) -> Option<usize> {
        self.hook
    }

    /// Where the interception lives, once installed
    pub fn site(&self) -> Option<Site> {
        self.site.get().copied()
    }

    /// Trampoline to the original behaviour, once installed
    pub fn trampoline(&self) -> Option<Trampoline> {
        self.trampoline.get().copied()
    }

    /// Records a successful install. Later installs of the same kind are ignored.
    pub(crate) fn install(&self, site: Site, trampoline: Trampoline) -> bool {
        if self.site.set(site).is_err() {
            return false;
        }
        self.trampoline.set(trampoline).is_ok()
    }
}

/// Interception records of one orchestrator, indexed by [`HookKind`]
#[derive(Debug)]
pub struct Registry {
    /// One record per kind
    records: [InterceptionRecord; HookKind::COUNT],
}

impl Registry {
    /// Creates empty records for the given hook routines
    pub fn new(hooks: &HookAddresses) -> Self {
        Self {
            records: HookKind::ALL.map(|kind| InterceptionRecord {
                hook: hooks.get(kind),
                ..Default::default()
            }),
        }
    }

    /// Record of `kind`
    pub fn record(&self, kind: HookKind) -> &InterceptionRecord {
        &self.records[kind.index()]
    }

    /// Trampoline of `kind`, if it was installed
    pub fn trampoline(&self, kind: HookKind) -> Option<Trampoline> {
        self.record(kind).trampoline()
    }

    /// Routes `symbol` in `module` to the hook of `kind`. Returns `true` if the interception is
    /// in place afterwards.
    pub fn route<H: SymbolResolver + CodeWriter + ?Sized>(
        &self,
        host: &H,
        kind: HookKind,
        module: ModuleId,
        symbol: &'static str,
    ) -> bool {
        let record = self.record(kind);
        if record.trampoline().is_some() {
            debug!(symbol, %kind, "already routed");
            return true;
        }
        let Some(hook) = record.hook() else {
            warn!(symbol, %kind, "no hook supplied, not routing");
            return false;
        };
        match intercept(host, module, symbol, hook) {
            Some(trampoline) => record.install(Site { module, symbol }, trampoline),
            None => false,
        }
    }
}

/// Resolves `symbol` in `module` and routes it to `hook`.
///
/// The trampoline is only returned when both steps succeeded; failures are logged and leave the
/// routine untouched.
pub fn intercept<H: SymbolResolver + CodeWriter + ?Sized>(
    host: &H,
    module: ModuleId,
    symbol: &str,
    hook: usize,
) -> Option<Trampoline> {
    let Some(address) = host.resolve(module, symbol) else {
        warn!(symbol, %module, "failed to resolve");
        return None;
    };
    debug!(symbol, address, "obtained");

    match host.install_transfer(address, hook) {
        Ok(trampoline) => {
            debug!(symbol, trampoline = trampoline.address(), "routed");
            Some(trampoline)
        }
        Err(e) => {
            warn!(symbol, "failed to route: {e}");
            None
        }
    }
}
