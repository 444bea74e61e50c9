//! # Config
//!
//! Boot-time options. The host hands over its boot argument string once at startup; the result
//! is immutable afterwards. Malformed values never abort startup, they fall back to the safe
//! default of not applying the affected corrective actions.

use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, warn};

use crate::host::{KernelVersion, VersionRange};

/// Turns every action off
pub const ARG_OFF: &str = "-ngfxoff";
/// Enables debug output in the embedding glue
pub const ARG_DEBUG: &str = "-ngfxdbg";
/// Allows running on host versions outside of [`SUPPORTED_VERSIONS`]
pub const ARG_BETA: &str = "-ngfxbeta";
/// Disables all audio fixes
pub const ARG_NO_AUDIO: &str = "-ngfxnoaudio";
/// Disables injection of `@N,connector-type`
pub const ARG_NO_AUDIO_CONNECTORS: &str = "-ngfxnoaudiocon";
/// Disables renderer id injection
pub const ARG_NO_VA_RENDERER: &str = "-ngfxnovarenderer";
/// Disables the platform binary override for the web driver's libraries
pub const ARG_NO_LIBVAL_FIX: &str = "-ngfxlibvalfix";
/// Rewrite groups to apply
pub const ARG_PATCH_LIST: &str = "ngfxpatch";
/// Forces driver compatibility on or off
pub const ARG_COMPAT: &str = "ngfxcompat";
/// Legacy submit optimisation on or off
pub const ARG_SUBMIT: &str = "ngfxsubmit";
/// Removes the Metal plugin from the accelerator
pub const ARG_GL: &str = "ngfxgl";

/// Patch list used when none is given
pub const DEFAULT_PATCH_LIST: &str = "vit9696";

/// Longest accepted patch list
pub const MAX_PATCH_LIST_LEN: usize = 63;

/// Host versions the fixes were written for
pub const SUPPORTED_VERSIONS: VersionRange =
    VersionRange::between(KernelVersion::MOUNTAIN_LION, KernelVersion::HIGH_SIERRA);

/// Errors while reading configuration values
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A boolean argument had a value other than `0` or `1`
    #[error("{arg}={value} is not 0 or 1")]
    BadFlag {
        /// Argument name
        arg: &'static str,
        /// Offending value
        value: String,
    },
    /// The patch list is not a short printable ASCII string
    #[error("malformed patch list \"{0}\"")]
    BadPatchList(String),
}

/// Parsed boot argument words, either `-flag` or `key=value`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootArgs {
    /// Words in the order given
    words: Vec<(String, Option<String>)>,
}

impl BootArgs {
    /// Splits a boot argument string on whitespace
    pub fn parse(line: &str) -> Self {
        let words = line
            .split_whitespace()
            .map(|word| match word.split_once('=') {
                Some((key, value)) => (key.to_string(), Some(value.to_string())),
                None => (word.to_string(), None),
            })
            .collect();
        Self { words }
    }

    /// Returns `true` if `name` was given, with or without a value
    pub fn has(&self, name: &str) -> bool {
        self.words.iter().any(|(key, _)| key == name)
    }

    /// Returns the value of the last `name=value` word
    pub fn value(&self, name: &str) -> Option<&str> {
        self.words
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| value.as_deref())
    }

    /// Reads `name=0` / `name=1`
    fn flag(&self, name: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.value(name) {
            None => Ok(None),
            Some("0") => Ok(Some(false)),
            Some("1") => Ok(Some(true)),
            Some(value) => Err(ConfigError::BadFlag {
                arg: name,
                value: value.to_string(),
            }),
        }
    }

    /// Reads `name=<integer>` as a switch where anything but zero means on
    fn switch(&self, name: &'static str) -> Result<Option<bool>, ConfigError> {
        self.value(name)
            .map(|value| {
                value
                    .parse::<i64>()
                    .map(|n| n != 0)
                    .map_err(|_| ConfigError::BadFlag {
                        arg: name,
                        value: value.to_string(),
                    })
            })
            .transpose()
    }
}

/// Named groups of graphics device policy fixes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchGroup {
    /// Rewrite the policy's config selector argument to zero
    Vit9696,
    /// Rename the `board-id` lookup key so no board matches
    Pikera,
    /// Intercept the policy start routine and set this board's config to `none`
    Cfgmap,
}

impl PatchGroup {
    /// Every group
    pub const ALL: [PatchGroup; 3] = [PatchGroup::Vit9696, PatchGroup::Pikera, PatchGroup::Cfgmap];

    /// Name used in the patch list
    pub fn name(&self) -> &'static str {
        match self {
            PatchGroup::Vit9696 => "vit9696",
            PatchGroup::Pikera => "pikera",
            PatchGroup::Cfgmap => "cfgmap",
        }
    }

    /// Bit in [`PatchGroups`]
    fn bit(&self) -> u8 {
        1 << (*self as u8)
    }
}

impl FromStr for PatchGroup {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|group| group.name().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

/// Set of enabled [`PatchGroup`]s
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchGroups(u8);

impl PatchGroups {
    /// No groups
    pub const NONE: PatchGroups = PatchGroups(0);

    /// Checks whether `group` is enabled
    pub fn contains(&self, group: PatchGroup) -> bool {
        self.0 & group.bit() != 0
    }

    /// Enables `group`
    pub fn insert(&mut self, group: PatchGroup) {
        self.0 |= group.bit();
    }

    /// Returns `true` if nothing is enabled
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Parses a list of group names separated by commas, spaces or any other punctuation.
    /// Unknown names are skipped.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        if list.len() > MAX_PATCH_LIST_LEN || !list.chars().all(|c| c.is_ascii_graphic() || c == ' ')
        {
            return Err(ConfigError::BadPatchList(list.to_string()));
        }

        let mut groups = Self::NONE;
        for name in list
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|name| !name.is_empty())
        {
            match name.parse::<PatchGroup>() {
                Ok(group) => groups.insert(group),
                Err(()) => warn!(name, "ignoring unknown patch group"),
            }
        }
        Ok(groups)
    }
}

impl Display for PatchGroups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = PatchGroup::ALL
            .iter()
            .filter(|group| self.contains(**group))
            .map(PatchGroup::name)
            .collect();
        write!(f, "{}", names.join(","))
    }
}

/// Options consulted by the orchestrator. Never mutated after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// Every action is disabled
    pub disabled: bool,
    /// Debug output requested
    pub debug: bool,
    /// Run on unsupported host versions
    pub beta: bool,
    /// Disable all audio fixes
    pub no_audio_fixes: bool,
    /// Disable adding `@0,connector-type` - `@5,connector-type`
    pub no_audio_connectors: bool,
    /// Disable renderer id injection
    pub no_va_renderer: bool,
    /// Disable the platform binary override
    pub no_libval_fix: bool,
    /// Enabled policy rewrite groups
    pub patch_groups: PatchGroups,
    /// Force driver compatibility. `None` leaves the driver's own check alone.
    pub force_compatibility: Option<bool>,
    /// Restore the legacy submit optimisation
    pub legacy_submit: bool,
    /// Remove the Metal plugin properties from the accelerator. `None` defers to the parent
    /// device's `disable-metal` property.
    pub force_opengl: Option<bool>,
}

impl Default for Configuration {
    fn default() -> Self {
        let mut patch_groups = PatchGroups::NONE;
        patch_groups.insert(PatchGroup::Vit9696);
        Self {
            disabled: false,
            debug: false,
            beta: false,
            no_audio_fixes: false,
            no_audio_connectors: false,
            no_va_renderer: false,
            no_libval_fix: false,
            patch_groups,
            force_compatibility: None,
            legacy_submit: true,
            force_opengl: None,
        }
    }
}

impl Configuration {
    /// Reads the configuration from boot arguments. Bad values are logged and replaced with the
    /// value that enables the fewest corrective actions.
    pub fn from_boot_args(args: &BootArgs) -> Self {
        let mut config = Self {
            disabled: args.has(ARG_OFF),
            debug: args.has(ARG_DEBUG),
            beta: args.has(ARG_BETA),
            no_audio_fixes: args.has(ARG_NO_AUDIO),
            no_audio_connectors: args.has(ARG_NO_AUDIO_CONNECTORS),
            no_va_renderer: args.has(ARG_NO_VA_RENDERER),
            no_libval_fix: args.has(ARG_NO_LIBVAL_FIX),
            ..Self::default()
        };

        match args.value(ARG_PATCH_LIST) {
            Some(list) => {
                debug!(list, "{ARG_PATCH_LIST} specified");
                config.patch_groups = PatchGroups::parse(list).unwrap_or_else(|e| {
                    warn!("{e}, no policy patches will be applied");
                    PatchGroups::NONE
                });
            }
            None => debug!("using default patch list {DEFAULT_PATCH_LIST}"),
        }

        config.force_compatibility = args.flag(ARG_COMPAT).unwrap_or_else(|e| {
            warn!("{e}");
            None
        });
        config.legacy_submit = match args.flag(ARG_SUBMIT) {
            Ok(value) => value.unwrap_or(true),
            Err(e) => {
                warn!("{e}");
                false
            }
        };
        config.force_opengl = args.switch(ARG_GL).unwrap_or_else(|e| {
            warn!("{e}");
            None
        });

        config
    }

    /// Checks whether the fixes may run on `version`
    pub fn supports(&self, version: KernelVersion) -> bool {
        self.beta || SUPPORTED_VERSIONS.contains(version)
    }
}
