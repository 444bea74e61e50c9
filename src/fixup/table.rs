//! # Table
//!
//! Every corrective action, declared as data. Each watched module owns a list of
//! [`ActionSpec`]s; whether one runs depends only on the configuration and the host version.

use crate::config::{Configuration, PatchGroup};
use crate::host::{KernelVersion, VersionRange};
use crate::router::HookKind;

/// One way the bytes to rewrite can look, and what they become
#[derive(Debug, Clone, Copy)]
pub struct Variant {
    /// Bytes to look for
    pub find: &'static [u8],
    /// Bytes written in their place, same length as `find`
    pub replace: &'static [u8],
}

/// A call site that is redirected to a hook
#[derive(Debug, Clone, Copy)]
pub struct CallSite {
    /// Routine the search starts at
    pub anchor: &'static str,
    /// Routine the call is expected to reach. The first candidate is taken if it can't be
    /// resolved.
    pub callee: &'static str,
    /// Number of bytes searched after the anchor
    pub window: usize,
    /// Register allocation variants of the call sequence
    pub variants: &'static [CallVariant],
}

/// One encoding of a call sequence
#[derive(Debug, Clone, Copy)]
pub struct CallVariant {
    /// Hex pattern of the sequence, `??` for the displacement
    pub pattern: &'static str,
    /// Offset of the `call rel32` inside the sequence
    pub call_offset: usize,
}

/// What an action does
#[derive(Debug, Clone, Copy)]
pub enum Action {
    /// Replaces the first occurrence of any variant inside the module
    Rewrite(&'static [Variant]),
    /// Intercepts a routine
    Route {
        /// Routine to intercept
        symbol: &'static str,
        /// Hook to route it to
        hook: HookKind,
    },
    /// Points an existing call at a hook, keeping its old target as the trampoline
    Redirect {
        /// Where the call is
        site: CallSite,
        /// Hook to call instead
        hook: HookKind,
    },
}

/// A corrective action and the conditions it runs under
#[derive(Debug, Clone, Copy)]
pub struct ActionSpec {
    /// Short name for logs
    pub name: &'static str,
    /// Configuration switch
    pub enabled: fn(&Configuration) -> bool,
    /// Host versions the action was written for
    pub versions: VersionRange,
    /// The work
    pub action: Action,
}

impl ActionSpec {
    /// Checks the configuration and the host version
    pub fn applies(&self, config: &Configuration, version: KernelVersion) -> bool {
        (self.enabled)(config) && self.versions.contains(version)
    }
}

/// A watched module and its actions
#[derive(Debug, Clone, Copy)]
pub struct ModuleSpec {
    /// Bundle identifier
    pub identifier: &'static str,
    /// Candidate on-disk locations
    pub paths: &'static [&'static str],
    /// Boards on this list don't need the module's actions
    pub skip_on_allowlisted_board: bool,
    /// Actions in the order they run
    pub actions: &'static [ActionSpec],
}

/// Graphics device policy
pub const AGDP: &str = "com.apple.driver.AppleGraphicsDevicePolicy";
/// Bundled NVIDIA driver
pub const GEFORCE: &str = "com.apple.GeForce";
/// NVIDIA web driver
pub const GEFORCE_WEB: &str = "com.nvidia.web.GeForceWeb";
/// Web driver startup companion
pub const NVDA_STARTUP_WEB: &str = "com.nvidia.NVDAStartupWeb";

/// Resolved before the platform binary routine is routed
pub const TEAM_ID_SYMBOL: &str = "_csfg_get_teamid";
/// Kernel routine that decides whether code is a platform binary
pub const PLATFORM_BINARY_SYMBOL: &str = "_csfg_get_platform_binary";
/// Hosts that validate library signatures against the platform binary flag
pub const LIBVAL_VERSIONS: VersionRange =
    VersionRange::between(KernelVersion::YOSEMITE, KernelVersion::SIERRA);

/// Boards whose policy leaves NVIDIA cards alone
pub const ALLOWLISTED_BOARDS: &[&str] = &[
    "Mac-F60DEB81FF30ACF6",
    "Mac-27AD2F918AE68F61",
    "Mac-7BA5B2D9E42DDD94",
];

/// Checks `board` against [`ALLOWLISTED_BOARDS`]
pub fn is_allowlisted(board: &str) -> bool {
    ALLOWLISTED_BOARDS.contains(&board)
}

/// Call sequences of `PreSubmit` inside the fifo `Prepare`, one per register the object lives in
const PRESUBMIT_CALLS: &[CallVariant] = &[
    // mov rdi, rbx
    CallVariant {
        pattern: "48 89 DF E8 ?? ?? ?? ??",
        call_offset: 3,
    },
    // mov rdi, r12
    CallVariant {
        pattern: "4C 89 E7 E8 ?? ?? ?? ??",
        call_offset: 3,
    },
    // mov rdi, r13
    CallVariant {
        pattern: "4C 89 EF E8 ?? ?? ?? ??",
        call_offset: 3,
    },
    // mov rdi, r14
    CallVariant {
        pattern: "4C 89 F7 E8 ?? ?? ?? ??",
        call_offset: 3,
    },
    // mov rdi, r15
    CallVariant {
        pattern: "4C 89 FF E8 ?? ?? ?? ??",
        call_offset: 3,
    },
];

/// Call site of `PreSubmit` in either driver
const PRESUBMIT_SITE: CallSite = CallSite {
    anchor: "__ZN15nvGpFifoChannel7PrepareEv",
    callee: "__ZN21nvVirtualAddressSpace9PreSubmitEv",
    window: 0x1000,
    variants: PRESUBMIT_CALLS,
};

/// Only the first High Sierra drivers had the optimisation
const LEGACY_SUBMIT_VERSIONS: VersionRange =
    VersionRange::between(KernelVersion::HIGH_SIERRA, KernelVersion::HIGH_SIERRA);

fn vit9696(config: &Configuration) -> bool {
    config.patch_groups.contains(PatchGroup::Vit9696)
}

fn pikera(config: &Configuration) -> bool {
    config.patch_groups.contains(PatchGroup::Pikera)
}

fn cfgmap(config: &Configuration) -> bool {
    config.patch_groups.contains(PatchGroup::Cfgmap)
}

fn renderer_id(config: &Configuration) -> bool {
    !config.no_va_renderer
}

fn legacy_submit(config: &Configuration) -> bool {
    config.legacy_submit
}

fn compatibility(config: &Configuration) -> bool {
    config.force_compatibility == Some(true)
}

/// Every watched module, in the order their completion bits are assigned
pub const MODULES: &[ModuleSpec] = &[
    ModuleSpec {
        identifier: AGDP,
        paths: &["/System/Library/Extensions/AppleGraphicsControl.kext/Contents/PlugIns/AppleGraphicsDevicePolicy.kext/Contents/MacOS/AppleGraphicsDevicePolicy"],
        skip_on_allowlisted_board: true,
        actions: &[
            ActionSpec {
                name: "vit9696",
                enabled: vit9696,
                versions: VersionRange::from(KernelVersion::MOUNTAIN_LION),
                // mov edx, 5 -> mov edx, 0 selects the "none" config
                action: Action::Rewrite(&[Variant {
                    find: &[0xba, 0x05, 0x00, 0x00, 0x00],
                    replace: &[0xba, 0x00, 0x00, 0x00, 0x00],
                }]),
            },
            ActionSpec {
                name: "pikera",
                enabled: pikera,
                versions: VersionRange::from(KernelVersion::MOUNTAIN_LION),
                action: Action::Rewrite(&[Variant {
                    find: b"board-id",
                    replace: b"board-ix",
                }]),
            },
            ActionSpec {
                name: "cfgmap",
                enabled: cfgmap,
                versions: VersionRange::from(KernelVersion::MOUNTAIN_LION),
                action: Action::Route {
                    symbol: "__ZN25AppleGraphicsDevicePolicy5startEP9IOService",
                    hook: HookKind::AgdpStart,
                },
            },
        ],
    },
    ModuleSpec {
        identifier: GEFORCE,
        paths: &["/System/Library/Extensions/GeForce.kext/Contents/MacOS/GeForce"],
        skip_on_allowlisted_board: false,
        actions: &[
            ActionSpec {
                name: "renderer id",
                enabled: renderer_id,
                versions: VersionRange::ANY,
                action: Action::Route {
                    symbol: "__ZN13nvAccelerator18SetAccelPropertiesEv",
                    hook: HookKind::SetAccelProperties,
                },
            },
            ActionSpec {
                name: "legacy submit",
                enabled: legacy_submit,
                versions: LEGACY_SUBMIT_VERSIONS,
                action: Action::Redirect {
                    site: PRESUBMIT_SITE,
                    hook: HookKind::PreSubmit,
                },
            },
        ],
    },
    ModuleSpec {
        identifier: GEFORCE_WEB,
        paths: &[
            "/Library/Extensions/GeForceWeb.kext/Contents/MacOS/GeForceWeb",
            "/System/Library/Extensions/GeForceWeb.kext/Contents/MacOS/GeForceWeb",
        ],
        skip_on_allowlisted_board: false,
        actions: &[
            ActionSpec {
                name: "renderer id",
                enabled: renderer_id,
                versions: VersionRange::ANY,
                action: Action::Route {
                    symbol: "__ZN19nvAcceleratorParent18SetAccelPropertiesEv",
                    hook: HookKind::SetAccelPropertiesWeb,
                },
            },
            ActionSpec {
                name: "legacy submit",
                enabled: legacy_submit,
                versions: LEGACY_SUBMIT_VERSIONS,
                action: Action::Redirect {
                    site: PRESUBMIT_SITE,
                    hook: HookKind::PreSubmitWeb,
                },
            },
        ],
    },
    ModuleSpec {
        identifier: NVDA_STARTUP_WEB,
        paths: &[
            "/Library/Extensions/NVDAStartupWeb.kext/Contents/MacOS/NVDAStartupWeb",
            "/System/Library/Extensions/NVDAStartupWeb.kext/Contents/MacOS/NVDAStartupWeb",
        ],
        skip_on_allowlisted_board: false,
        actions: &[ActionSpec {
            name: "compatibility",
            enabled: compatibility,
            versions: VersionRange::ANY,
            action: Action::Route {
                symbol: "__ZN14NVDAStartupWeb5probeEP9IOServicePi",
                hook: HookKind::NvdaStartupProbe,
            },
        }],
    },
];
