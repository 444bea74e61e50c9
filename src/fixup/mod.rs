//! # Fixup
//!
//! The orchestrator. It owns the configuration, the watch-list with its completion mask and the
//! interception registry, and turns host notifications into corrective actions:
//!
//! * [`Fixup::on_host_ready`] runs the module independent action once the host can resolve its
//!   own symbols.
//! * [`Fixup::on_module_loaded`] runs every enabled action of a watched module the first time
//!   the module is reported.
//!
//! A failing action is logged and skipped. It never stops the other actions of the module, and
//! the module still counts as processed afterwards.

pub mod hooks;
pub mod table;

use std::sync::OnceLock;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::code::x64::{branch_target, relocate, EncodeError};
use crate::config::{Configuration, ARG_OFF};
use crate::host::{Host, HostError, ModuleId, Trampoline};
use crate::pattern::{self, Pattern, PatternError};
use crate::router::{HookAddresses, HookKind, Registry, Site};
use crate::watch::{LoadedModule, WatchList, HOST_READY};
use crate::window::{clamp_to_module, Window};

use self::table::{
    is_allowlisted, Action, CallSite, ModuleSpec, Variant, LIBVAL_VERSIONS, MODULES,
    PLATFORM_BINARY_SYMBOL, TEAM_ID_SYMBOL,
};

/// Length of `call rel32`
const CALL_LEN: usize = 5;

/// Reasons a single corrective action was skipped
#[derive(Debug, Error)]
pub enum ActionError {
    /// A symbol the action needs is missing
    #[error("failed to resolve {0}")]
    Unresolved(&'static str),
    /// None of the byte variants occur
    #[error("no variant found")]
    NotFound,
    /// The search would start outside the module
    #[error("{0:#x} is outside of the module")]
    OutsideModule(usize),
    /// The embedding glue supplied no hook routine
    #[error("no hook for {0}")]
    NoHook(HookKind),
    /// The interception could not be installed
    #[error("failed to route {0}")]
    NotRouted(&'static str),
    /// A declared pattern is malformed
    #[error("{0}")]
    Pattern(#[from] PatternError),
    /// The replacement could not be encoded
    #[error("{0}")]
    Encode(#[from] EncodeError),
    /// Module memory could not be accessed
    #[error("{0}")]
    Host(#[from] HostError),
}

/// Graphics driver fixup engine
#[derive(Debug)]
pub struct Fixup {
    /// Options read at startup
    config: Configuration,
    /// Watched modules and progress
    watch: WatchList,
    /// Interceptions and their trampolines
    registry: Registry,
    /// `_csfg_get_teamid`, needed by the platform binary hook
    team_id: OnceLock<usize>,
}

impl Fixup {
    /// Creates the engine. `hooks` are the glue's routines that interceptions transfer to.
    pub fn new(config: Configuration, hooks: &HookAddresses) -> Self {
        let modules: Vec<_> = MODULES.iter().map(|m| (m.identifier, m.paths)).collect();
        let watch = WatchList::new(&modules);
        if config.disabled {
            info!("disabled by {ARG_OFF}");
            watch.state().finish_all();
        }
        debug!(patches = %config.patch_groups, "configured");
        Self {
            config,
            watch,
            registry: Registry::new(hooks),
            team_id: OnceLock::new(),
        }
    }

    /// Options in effect
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Modules the glue should subscribe to
    pub fn watch_list(&self) -> &WatchList {
        &self.watch
    }

    /// Interception records
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Trampoline of `kind`, if its interception is in place
    pub fn trampoline(&self, kind: HookKind) -> Option<Trampoline> {
        self.registry.trampoline(kind)
    }

    /// Address of `_csfg_get_teamid`, once resolved
    pub fn team_id_resolver(&self) -> Option<usize> {
        self.team_id.get().copied()
    }

    /// Returns `true` once every action was attempted or skipped
    pub fn is_done(&self) -> bool {
        self.watch.state().is_done()
    }

    /// Returns `false` if no more work will ever be done. Unsupported hosts finish everything.
    fn active<H: Host + ?Sized>(&self, host: &H) -> bool {
        let state = self.watch.state();
        if state.is_done() {
            return false;
        }
        let version = host.version();
        if !self.config.supports(version) {
            info!(%version, "unsupported host version, use -ngfxbeta to force");
            state.finish_all();
            return false;
        }
        true
    }

    /// Host can resolve its own symbols
    pub fn on_host_ready<H: Host + ?Sized>(&self, host: &H) {
        if !self.active(host) {
            return;
        }
        let state = self.watch.state();
        if !state.claim(HOST_READY) {
            return;
        }

        if self.config.no_libval_fix {
            debug!("platform binary override disabled");
        } else if !LIBVAL_VERSIONS.contains(host.version()) {
            debug!("platform binary override not needed");
        } else if let Err(e) = self.route_platform_binary(host) {
            warn!("platform binary override: {e}");
        }
        state.complete(HOST_READY);
    }

    /// Resolves the team id routine and intercepts the platform binary check
    fn route_platform_binary<H: Host + ?Sized>(&self, host: &H) -> Result<(), ActionError> {
        let team_id = host
            .resolve(ModuleId::KERNEL, TEAM_ID_SYMBOL)
            .ok_or(ActionError::Unresolved(TEAM_ID_SYMBOL))?;
        debug!(address = team_id, "obtained {TEAM_ID_SYMBOL}");
        let _ = self.team_id.set(team_id);

        self.route(
            host,
            ModuleId::KERNEL,
            PLATFORM_BINARY_SYMBOL,
            HookKind::PlatformBinary,
        )
    }

    /// A module was loaded at `address..address + size`
    pub fn on_module_loaded<H: Host + ?Sized>(
        &self,
        host: &H,
        identifier: &str,
        id: ModuleId,
        address: usize,
        size: usize,
    ) {
        if !self.active(host) {
            return;
        }
        let Some(module) = self.watch.record(identifier, id, address, size) else {
            return;
        };
        let state = self.watch.state();
        if !state.claim(module.bit()) {
            debug!(identifier, "already processed");
            return;
        }
        let (Some(spec), Some(loaded)) = (
            MODULES.iter().find(|spec| spec.identifier == identifier),
            module.loaded(),
        ) else {
            state.complete(module.bit());
            return;
        };

        debug!(identifier, %id, address = loaded.address, "found");
        self.process(host, spec, loaded);
        state.complete(module.bit());
    }

    /// Runs every enabled action of `spec`
    fn process<H: Host + ?Sized>(&self, host: &H, spec: &ModuleSpec, module: LoadedModule) {
        if spec.skip_on_allowlisted_board {
            if let Some(board) = host.identity().filter(|board| is_allowlisted(board)) {
                info!(board = %board, module = spec.identifier, "board needs no fixes");
                return;
            }
        }

        let version = host.version();
        for action in spec.actions {
            if !action.applies(&self.config, version) {
                debug!(module = spec.identifier, action = action.name, "skipped");
                continue;
            }
            let result = match action.action {
                Action::Rewrite(variants) => self.rewrite(host, module, variants),
                Action::Route { symbol, hook } => self.route(host, module.id, symbol, hook),
                Action::Redirect { site, hook } => self.redirect(host, module, &site, hook),
            };
            match result {
                Ok(()) => debug!(module = spec.identifier, action = action.name, "applied"),
                Err(e) => warn!(module = spec.identifier, action = action.name, "{e}"),
            }
        }
    }

    /// Replaces the first occurrence of any variant inside the module
    fn rewrite<H: Host + ?Sized>(
        &self,
        host: &H,
        module: LoadedModule,
        variants: &[Variant],
    ) -> Result<(), ActionError> {
        let patterns = variants
            .iter()
            .map(|variant| Pattern::from_bytes(variant.find))
            .collect::<Result<Vec<_>, _>>()?;

        let bytes = host.read_bytes(module.address, module.size)?;
        let window = Window::new(module.address, &bytes);
        let found = pattern::find(&window, &patterns).ok_or(ActionError::NotFound)?;

        let replace = variants[found.candidate].replace;
        host.write_bytes(found.address(&window), replace)?;
        Ok(())
    }

    /// Intercepts `symbol` with the hook of `kind`
    fn route<H: Host + ?Sized>(
        &self,
        host: &H,
        module: ModuleId,
        symbol: &'static str,
        kind: HookKind,
    ) -> Result<(), ActionError> {
        if self.registry.record(kind).hook().is_none() {
            return Err(ActionError::NoHook(kind));
        }
        if self.registry.route(host, kind, module, symbol) {
            Ok(())
        } else {
            Err(ActionError::NotRouted(symbol))
        }
    }

    /// Points the call described by `site` at the hook of `kind`
    fn redirect<H: Host + ?Sized>(
        &self,
        host: &H,
        module: LoadedModule,
        site: &CallSite,
        kind: HookKind,
    ) -> Result<(), ActionError> {
        let record = self.registry.record(kind);
        if record.trampoline().is_some() {
            return Ok(());
        }
        let hook = record.hook().ok_or(ActionError::NoHook(kind))?;
        let patterns = site
            .variants
            .iter()
            .map(|variant| Pattern::parse(variant.pattern))
            .collect::<Result<Vec<_>, _>>()?;

        let anchor = host
            .resolve_in(module.id, site.anchor, module.address, module.size)
            .ok_or(ActionError::Unresolved(site.anchor))?;
        let len = clamp_to_module(anchor, site.window, module.address, module.size)
            .ok_or(ActionError::OutsideModule(anchor))?;
        let bytes = host.read_bytes(anchor, len)?;
        let window = Window::new(anchor, &bytes);

        let callee = host.resolve_in(module.id, site.callee, module.address, module.size);
        if callee.is_none() {
            debug!(symbol = site.callee, "unresolved, taking the first call");
        }

        let mut start = 0;
        let (call, insn, original) = loop {
            let rest = window
                .sub(start, window.len())
                .ok_or(ActionError::NotFound)?;
            let found = pattern::find(&rest, &patterns).ok_or(ActionError::NotFound)?;
            let offset = start + found.offset + site.variants[found.candidate].call_offset;
            let insn = window
                .get(offset, CALL_LEN)
                .ok_or(ActionError::NotFound)?;
            let call = anchor + offset;
            let original = branch_target(insn, call)?;
            if callee.map_or(true, |callee| callee == original) {
                break (call, insn, original);
            }
            debug!(call, original, "call reaches another routine");
            start += found.offset + 1;
        };

        let trampoline = Trampoline::new(original).ok_or(ActionError::NotFound)?;
        let patched = relocate(insn, 0, call, hook)?;
        host.write_bytes(call, &patched)?;
        record.install(
            Site {
                module: module.id,
                symbol: site.anchor,
            },
            trampoline,
        );
        debug!(call, original, hook, "redirected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::table::{AGDP, GEFORCE, GEFORCE_WEB, NVDA_STARTUP_WEB};
    use super::Fixup;
    use crate::config::{BootArgs, Configuration};
    use crate::host::{KernelVersion, ModuleId, Trampoline};
    use crate::router::{HookAddresses, HookKind};
    use crate::testing::MockHost;
    use crate::watch::{ModuleState, HOST_READY};

    const AGDP_ID: ModuleId = ModuleId(1);
    const GEFORCE_ID: ModuleId = ModuleId(2);
    const WEB_ID: ModuleId = ModuleId(3);
    const STARTUP_ID: ModuleId = ModuleId(4);

    const AGDP_BASE: usize = 0x10_0000;
    const GEFORCE_BASE: usize = 0x20_0000;
    const WEB_BASE: usize = 0x30_0000;
    const STARTUP_BASE: usize = 0x40_0000;
    const SIZE: usize = 0x2000;

    const AGDP_START: &str = "__ZN25AppleGraphicsDevicePolicy5startEP9IOService";
    const SET_ACCEL: &str = "__ZN13nvAccelerator18SetAccelPropertiesEv";
    const SET_ACCEL_WEB: &str = "__ZN19nvAcceleratorParent18SetAccelPropertiesEv";
    const PREPARE: &str = "__ZN15nvGpFifoChannel7PrepareEv";
    const PRESUBMIT: &str = "__ZN21nvVirtualAddressSpace9PreSubmitEv";
    const PROBE: &str = "__ZN14NVDAStartupWeb5probeEP9IOServicePi";

    fn hooks() -> HookAddresses {
        HookAddresses::new()
            .with(HookKind::PlatformBinary, 0xf000_0000)
            .with(HookKind::AgdpStart, 0xf000_0100)
            .with(HookKind::SetAccelProperties, 0xf000_0200)
            .with(HookKind::SetAccelPropertiesWeb, 0xf000_0300)
            .with(HookKind::NvdaStartupProbe, 0xf000_0400)
            .with(HookKind::PreSubmit, GEFORCE_BASE + 0x1800)
            .with(HookKind::PreSubmitWeb, WEB_BASE + 0x1800)
    }

    fn fixup(args: &str) -> Fixup {
        Fixup::new(Configuration::from_boot_args(&BootArgs::parse(args)), &hooks())
    }

    /// Policy image with `mov edx, 5` at 0x120 and the `board-id` key at 0x400
    fn agdp_image() -> Vec<u8> {
        let mut image = vec![0x90; SIZE];
        image[0x120..0x125].copy_from_slice(&[0xba, 0x05, 0x00, 0x00, 0x00]);
        image[0x400..0x408].copy_from_slice(b"board-id");
        image
    }

    /// Driver image whose `Prepare` at 0x100 calls something else first and `PreSubmit` at
    /// 0x1000 second
    fn driver_image() -> Vec<u8> {
        let mut image = vec![0xcc; SIZE];
        // mov rdi, rbx; call 0x1400
        image[0x110..0x118].copy_from_slice(&[0x48, 0x89, 0xdf, 0xe8, 0xe8, 0x12, 0x00, 0x00]);
        // mov rdi, r14; call 0x1000
        image[0x140..0x148].copy_from_slice(&[0x4c, 0x89, 0xf7, 0xe8, 0xb8, 0x0e, 0x00, 0x00]);
        image
    }

    /// A host with every module's symbols and images
    fn host() -> MockHost {
        MockHost::new()
            .memory(AGDP_BASE, &agdp_image())
            .memory(GEFORCE_BASE, &driver_image())
            .memory(WEB_BASE, &driver_image())
            .memory(STARTUP_BASE, &vec![0xcc; SIZE])
            .symbol(AGDP_ID, AGDP_START, AGDP_BASE + 0x80)
            .symbol(GEFORCE_ID, SET_ACCEL, GEFORCE_BASE + 0x40)
            .symbol(GEFORCE_ID, PREPARE, GEFORCE_BASE + 0x100)
            .symbol(GEFORCE_ID, PRESUBMIT, GEFORCE_BASE + 0x1000)
            .symbol(WEB_ID, SET_ACCEL_WEB, WEB_BASE + 0x40)
            .symbol(WEB_ID, PREPARE, WEB_BASE + 0x100)
            .symbol(WEB_ID, PRESUBMIT, WEB_BASE + 0x1000)
            .symbol(STARTUP_ID, PROBE, STARTUP_BASE + 0x40)
            .symbol(ModuleId::KERNEL, "_csfg_get_teamid", 0xffff_ff80_0010_0000)
            .symbol(
                ModuleId::KERNEL,
                "_csfg_get_platform_binary",
                0xffff_ff80_0010_0100,
            )
    }

    fn load_all(fixup: &Fixup, host: &MockHost) {
        fixup.on_module_loaded(host, AGDP, AGDP_ID, AGDP_BASE, SIZE);
        fixup.on_module_loaded(host, GEFORCE, GEFORCE_ID, GEFORCE_BASE, SIZE);
        fixup.on_module_loaded(host, GEFORCE_WEB, WEB_ID, WEB_BASE, SIZE);
        fixup.on_module_loaded(host, NVDA_STARTUP_WEB, STARTUP_ID, STARTUP_BASE, SIZE);
    }

    #[test]
    fn test_watch_list() {
        let fixup = fixup("");
        let ids: Vec<_> = fixup
            .watch_list()
            .modules()
            .iter()
            .map(|m| m.identifier())
            .collect();
        assert_eq!(ids, [AGDP, GEFORCE, GEFORCE_WEB, NVDA_STARTUP_WEB]);
        assert_eq!(fixup.watch_list().get(GEFORCE_WEB).unwrap().paths().len(), 2);
    }

    #[test]
    fn test_rewrite() {
        let host = host();
        let fixup = fixup("");

        fixup.on_module_loaded(&host, AGDP, AGDP_ID, AGDP_BASE, SIZE);
        assert_eq!(
            host.bytes(AGDP_BASE + 0x120, 5).unwrap(),
            [0xba, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(host.bytes(AGDP_BASE + 0x400, 8).unwrap(), b"board-id");
        assert_eq!(
            fixup.watch_list().module_state(AGDP),
            Some(ModuleState::ActionsComplete)
        );
        // cfgmap is not in the default list
        assert_eq!(fixup.trampoline(HookKind::AgdpStart), None);
    }

    #[test]
    fn test_patch_groups() {
        let host = host();
        let fixup = fixup("ngfxpatch=pikera,cfgmap");

        fixup.on_module_loaded(&host, AGDP, AGDP_ID, AGDP_BASE, SIZE);
        assert_eq!(
            host.bytes(AGDP_BASE + 0x120, 5).unwrap(),
            [0xba, 0x05, 0x00, 0x00, 0x00]
        );
        assert_eq!(host.bytes(AGDP_BASE + 0x400, 8).unwrap(), b"board-ix");
        assert_eq!(
            fixup.trampoline(HookKind::AgdpStart),
            host.trampoline_for(AGDP_BASE + 0x80)
        );
    }

    #[test]
    /// A second notification for the same module does no work
    fn test_idempotent() {
        let host = host();
        let fixup = fixup("ngfxpatch=vit9696,cfgmap");

        fixup.on_module_loaded(&host, AGDP, AGDP_ID, AGDP_BASE, SIZE);
        let resolves = host.resolve_calls();
        let reads = host.reads().len();
        let writes = host.writes().len();

        fixup.on_module_loaded(&host, AGDP, AGDP_ID, AGDP_BASE, SIZE);
        assert_eq!(host.resolve_calls(), resolves);
        assert_eq!(host.reads().len(), reads);
        assert_eq!(host.writes().len(), writes);
        assert_eq!(host.installs().len(), 1);
    }

    #[test]
    /// A missing pattern in one module leaves the next one alone
    fn test_missing_pattern() {
        let host = host().memory(0x50_0000, &vec![0x90; SIZE]);
        let fixup = fixup("-ngfxnovarenderer");

        fixup.on_module_loaded(&host, AGDP, AGDP_ID, 0x50_0000, SIZE);
        assert!(host.writes().is_empty());
        assert_eq!(
            fixup.watch_list().module_state(AGDP),
            Some(ModuleState::ActionsComplete)
        );

        fixup.on_module_loaded(&host, GEFORCE, GEFORCE_ID, GEFORCE_BASE, SIZE);
        assert!(fixup.trampoline(HookKind::PreSubmit).is_some());
        assert_eq!(
            fixup.watch_list().module_state(GEFORCE),
            Some(ModuleState::ActionsComplete)
        );
    }

    #[test]
    /// The PreSubmit call is pointed at the hook and its old target becomes the trampoline
    fn test_redirect() {
        let host = host();
        let fixup = fixup("");

        fixup.on_module_loaded(&host, GEFORCE, GEFORCE_ID, GEFORCE_BASE, SIZE);

        // the first call reaches 0x1400, not PreSubmit, and stays put
        assert_eq!(
            host.bytes(GEFORCE_BASE + 0x113, 5).unwrap(),
            [0xe8, 0xe8, 0x12, 0x00, 0x00]
        );
        // call 0x1800 from 0x143
        assert_eq!(
            host.bytes(GEFORCE_BASE + 0x143, 5).unwrap(),
            [0xe8, 0xb8, 0x16, 0x00, 0x00]
        );
        assert_eq!(
            fixup.trampoline(HookKind::PreSubmit),
            Trampoline::new(GEFORCE_BASE + 0x1000)
        );
        assert_eq!(
            fixup.registry().record(HookKind::PreSubmit).site().unwrap().module,
            GEFORCE_ID
        );
        // renderer id is routed separately
        assert_eq!(
            fixup.trampoline(HookKind::SetAccelProperties),
            host.trampoline_for(GEFORCE_BASE + 0x40)
        );
        assert_eq!(fixup.trampoline(HookKind::SetAccelPropertiesWeb), None);
    }

    #[test]
    /// Without the callee symbol the first matching call is taken
    fn test_redirect_without_callee() {
        let host = MockHost::new()
            .memory(GEFORCE_BASE, &driver_image())
            .symbol(GEFORCE_ID, PREPARE, GEFORCE_BASE + 0x100);
        let fixup = fixup("-ngfxnovarenderer");

        fixup.on_module_loaded(&host, GEFORCE, GEFORCE_ID, GEFORCE_BASE, SIZE);
        assert_eq!(
            fixup.trampoline(HookKind::PreSubmit),
            Trampoline::new(GEFORCE_BASE + 0x1400)
        );
        // call 0x1800 from 0x113
        assert_eq!(
            host.bytes(GEFORCE_BASE + 0x113, 5).unwrap(),
            [0xe8, 0xe8, 0x16, 0x00, 0x00]
        );
    }

    #[test]
    /// Symbols resolving into another module are not used
    fn test_redirect_foreign_symbols() {
        {
            let host = MockHost::new()
                .memory(GEFORCE_BASE, &driver_image())
                .memory(WEB_BASE, &driver_image())
                .symbol(GEFORCE_ID, PREPARE, WEB_BASE + 0x100);
            let fixup = fixup("-ngfxnovarenderer");

            fixup.on_module_loaded(&host, GEFORCE, GEFORCE_ID, GEFORCE_BASE, SIZE);
            assert_eq!(fixup.trampoline(HookKind::PreSubmit), None);
            assert!(host.reads().is_empty());
            assert!(host.writes().is_empty());
        }

        // a foreign callee counts as unresolved, so the first call is taken
        let host = MockHost::new()
            .memory(GEFORCE_BASE, &driver_image())
            .symbol(GEFORCE_ID, PREPARE, GEFORCE_BASE + 0x100)
            .symbol(GEFORCE_ID, PRESUBMIT, WEB_BASE + 0x1000);
        let fixup = fixup("-ngfxnovarenderer");

        fixup.on_module_loaded(&host, GEFORCE, GEFORCE_ID, GEFORCE_BASE, SIZE);
        assert_eq!(
            fixup.trampoline(HookKind::PreSubmit),
            Trampoline::new(GEFORCE_BASE + 0x1400)
        );
    }

    #[test]
    fn test_version_gating() {
        let host = host().version(KernelVersion::SIERRA);
        let fixup = fixup("");

        fixup.on_module_loaded(&host, GEFORCE, GEFORCE_ID, GEFORCE_BASE, SIZE);
        assert!(fixup.trampoline(HookKind::SetAccelProperties).is_some());
        assert_eq!(fixup.trampoline(HookKind::PreSubmit), None);
        assert!(host.writes().is_empty());
        assert!(!host.reads().iter().any(|(address, _)| *address == GEFORCE_BASE + 0x100));
    }

    #[test]
    fn test_disabled_submit() {
        let host = host();
        let fixup = fixup("ngfxsubmit=0 -ngfxnovarenderer");

        fixup.on_module_loaded(&host, GEFORCE_WEB, WEB_ID, WEB_BASE, SIZE);
        assert_eq!(host.resolve_calls(), 0);
        assert_eq!(
            fixup.watch_list().module_state(GEFORCE_WEB),
            Some(ModuleState::ActionsComplete)
        );
    }

    #[test]
    /// Failing actions are isolated and the module still completes
    fn test_partial_failure() {
        let host = host().fail_install(WEB_BASE + 0x40);
        let fixup = fixup("");

        fixup.on_module_loaded(&host, GEFORCE_WEB, WEB_ID, WEB_BASE, SIZE);
        assert_eq!(fixup.trampoline(HookKind::SetAccelPropertiesWeb), None);
        assert_eq!(
            fixup.trampoline(HookKind::PreSubmitWeb),
            Trampoline::new(WEB_BASE + 0x1000)
        );
        assert_eq!(
            fixup.watch_list().module_state(GEFORCE_WEB),
            Some(ModuleState::ActionsComplete)
        );
    }

    #[test]
    fn test_host_ready() {
        let host = host().version(KernelVersion::EL_CAPITAN);
        let fixup = fixup("");

        fixup.on_host_ready(&host);
        assert_eq!(fixup.team_id_resolver(), Some(0xffff_ff80_0010_0000));
        assert_eq!(
            fixup.trampoline(HookKind::PlatformBinary),
            host.trampoline_for(0xffff_ff80_0010_0100)
        );
        assert!(fixup.watch_list().state().is_complete(HOST_READY));

        fixup.on_host_ready(&host);
        assert_eq!(host.installs().len(), 1);
    }

    #[test]
    /// The override only runs from Yosemite through Sierra
    fn test_host_ready_versions() {
        for (version, routed) in [
            (KernelVersion::MAVERICKS, false),
            (KernelVersion::YOSEMITE, true),
            (KernelVersion::SIERRA, true),
            (KernelVersion::HIGH_SIERRA, false),
        ] {
            let host = host().version(version);
            let fixup = fixup("");
            fixup.on_host_ready(&host);
            assert_eq!(fixup.trampoline(HookKind::PlatformBinary).is_some(), routed);
            assert!(fixup.watch_list().state().is_complete(HOST_READY));
        }

        let host = host().version(KernelVersion::SIERRA);
        let fixup = fixup("-ngfxlibvalfix");
        fixup.on_host_ready(&host);
        assert_eq!(host.resolve_calls(), 0);
        assert!(fixup.watch_list().state().is_complete(HOST_READY));
    }

    #[test]
    fn test_unsupported_version() {
        let host = host().version(KernelVersion::MOJAVE);
        let fixup = fixup("");

        load_all(&fixup, &host);
        assert!(fixup.is_done());
        assert_eq!(host.resolve_calls(), 0);
        assert!(host.reads().is_empty());

        let fixup = self::fixup("-ngfxbeta");
        fixup.on_module_loaded(&host, AGDP, AGDP_ID, AGDP_BASE, SIZE);
        assert_eq!(host.writes().len(), 1);
    }

    #[test]
    fn test_disabled() {
        let host = host();
        let fixup = fixup("-ngfxoff");
        assert!(fixup.is_done());

        fixup.on_host_ready(&host);
        load_all(&fixup, &host);
        assert_eq!(host.resolve_calls(), 0);
        assert!(host.reads().is_empty());
    }

    #[test]
    /// Once everything was attempted, notifications touch nothing
    fn test_terminal() {
        let host = host();
        let fixup = fixup("ngfxcompat=1");

        fixup.on_host_ready(&host);
        load_all(&fixup, &host);
        assert!(fixup.is_done());
        assert_eq!(
            fixup.trampoline(HookKind::NvdaStartupProbe),
            host.trampoline_for(STARTUP_BASE + 0x40)
        );

        let resolves = host.resolve_calls();
        let reads = host.reads().len();
        load_all(&fixup, &host);
        fixup.on_host_ready(&host);
        assert_eq!(host.resolve_calls(), resolves);
        assert_eq!(host.reads().len(), reads);
    }

    #[test]
    fn test_allowlisted_board() {
        let host = host().identity(Some("Mac-7BA5B2D9E42DDD94"));
        let fixup = fixup("ngfxpatch=vit9696,pikera,cfgmap");

        fixup.on_module_loaded(&host, AGDP, AGDP_ID, AGDP_BASE, SIZE);
        assert!(host.reads().is_empty());
        assert!(host.writes().is_empty());
        assert_eq!(host.resolve_calls(), 0);
        assert_eq!(
            fixup.watch_list().module_state(AGDP),
            Some(ModuleState::ActionsComplete)
        );
    }

    #[test]
    fn test_missing_hook() {
        let host = host();
        let fixup = Fixup::new(Configuration::default(), &HookAddresses::new());

        fixup.on_module_loaded(&host, GEFORCE, GEFORCE_ID, GEFORCE_BASE, SIZE);
        assert!(host.installs().is_empty());
        assert!(host.writes().is_empty());
        assert_eq!(
            fixup.watch_list().module_state(GEFORCE),
            Some(ModuleState::ActionsComplete)
        );
    }

    #[test]
    fn test_unwatched() {
        let host = host();
        let fixup = fixup("");
        fixup.on_module_loaded(&host, "com.apple.iokit.IOHDAFamily", ModuleId(9), 0, SIZE);
        assert_eq!(host.resolve_calls(), 0);
        assert!(!fixup.is_done());
    }

    #[test]
    /// Modules reported from several threads are each processed once
    fn test_concurrent() {
        let host = Arc::new(host());
        let fixup = Arc::new(fixup("ngfxpatch=vit9696,cfgmap"));

        let handles: Vec<_> = [
            (AGDP, AGDP_ID, AGDP_BASE),
            (GEFORCE, GEFORCE_ID, GEFORCE_BASE),
            (GEFORCE_WEB, WEB_ID, WEB_BASE),
            (NVDA_STARTUP_WEB, STARTUP_ID, STARTUP_BASE),
        ]
        .into_iter()
        .map(|(identifier, id, base)| {
            let host = host.clone();
            let fixup = fixup.clone();
            thread::spawn(move || fixup.on_module_loaded(&*host, identifier, id, base, SIZE))
        })
        .collect();
        fixup.on_host_ready(&*host);
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(fixup.is_done());
        // cfgmap, both renderer ids
        assert_eq!(host.installs().len(), 3);
        assert!(fixup.trampoline(HookKind::PreSubmit).is_some());
        assert!(fixup.trampoline(HookKind::PreSubmitWeb).is_some());
    }
}
