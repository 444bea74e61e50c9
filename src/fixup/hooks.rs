//! # Hooks
//!
//! Bodies of the intercepted routines. The embedding glue exports the actual `extern` entry
//! points, looks up its trampoline in the [`Registry`](crate::router::Registry) and calls one of
//! these with the original routine wrapped in a closure. `None` means the interception never
//! completed, in which case the bodies modify nothing.

use tracing::{debug, warn};

use crate::service::{Service, Value};

/// Team identifier NVIDIA signs its drivers with
pub const NVIDIA_TEAM_ID: &str = "6KR3T733EC";

/// Renderer id the accelerator is given when it has none
pub const RENDERER_ID: [u8; 4] = [0x08, 0x00, 0x04, 0x01];
/// Renderer sub id the accelerator is given when it has none
pub const RENDERER_SUB_ID: [u8; 4] = [0x03, 0x00, 0x00, 0x00];

/// Accelerator properties that make the OS pick the Metal plugin
pub const METAL_PROPERTIES: [&str; 3] =
    ["MetalPluginClassName", "MetalPluginName", "MetalStatisticsName"];

/// Parent property that asks for Metal to be disabled
pub const DISABLE_METAL: &str = "disable-metal";

/// Property table key of the policy's per-board configuration
pub const CONFIG_MAP: &str = "ConfigMap";

/// Property the startup driver compares with the running OS build
pub const REQUIRED_OS: &str = "NVDARequiredOS";

/// `_csfg_get_platform_binary`: treats NVIDIA signed code as a platform binary.
///
/// | trampoline | original | team id  | result |
/// |------------|----------|----------|--------|
/// | missing    |          |          | false  |
/// | present    | true     |          | true   |
/// | present    | false    | NVIDIA   | true   |
/// | present    | false    | other    | false  |
///
/// `team_id` is only called when the original said no.
pub fn platform_binary(
    original: Option<impl FnOnce() -> bool>,
    team_id: impl FnOnce() -> Option<String>,
) -> bool {
    let Some(original) = original else {
        return false;
    };
    if original() {
        return true;
    }
    if team_id().as_deref() == Some(NVIDIA_TEAM_ID) {
        debug!("platform binary override for {NVIDIA_TEAM_ID}");
        return true;
    }
    false
}

/// `SetAccelProperties`: runs the original, then fills in a renderer id if the driver did not
/// publish one and drops the Metal plugin if OpenGL is forced. Without `force_opengl` the
/// parent's `disable-metal` decides.
pub fn set_accel_properties<S: Service + ?Sized>(
    original: Option<impl FnOnce(&mut S)>,
    accelerator: &mut S,
    force_opengl: Option<bool>,
) {
    let Some(original) = original else {
        return;
    };
    original(accelerator);

    if accelerator.property("IOVARendererID").is_none()
        && accelerator.set_property("IOVARendererID", Value::Data(RENDERER_ID.to_vec()))
    {
        debug!("set IOVARendererID to 08 00 04 01");
    }
    if accelerator.property("IOVARendererSubID").is_none()
        && accelerator.set_property("IOVARendererSubID", Value::Data(RENDERER_SUB_ID.to_vec()))
    {
        debug!("set IOVARendererSubID to 03 00 00 00");
    }

    let disable_metal = force_opengl
        .unwrap_or_else(|| accelerator.parent_property(DISABLE_METAL).is_some());
    if disable_metal {
        debug!("disabling metal support");
        for key in METAL_PROPERTIES {
            accelerator.remove_property(key);
        }
    }
}

/// `AppleGraphicsDevicePolicy::start`: sets this board's entry in the policy's config map to
/// `none` before the policy reads it
pub fn agdp_start<S: Service + ?Sized>(
    original: Option<impl FnOnce(&mut S) -> bool>,
    policy: &mut S,
    board_id: Option<&str>,
) -> bool {
    let Some(original) = original else {
        return false;
    };

    match board_id {
        Some(board_id) => {
            debug!(board_id, "got board-id");
            match policy.property(CONFIG_MAP) {
                Some(Value::Dict(mut config_map)) => {
                    if let Some(current) = config_map.get(board_id).and_then(Value::as_str) {
                        debug!(board_id, current, "current policy configuration");
                    }
                    config_map.insert(board_id.to_string(), Value::String("none".into()));
                    if policy.set_property(CONFIG_MAP, Value::Dict(config_map)) {
                        debug!(board_id, "policy configuration set to none");
                    } else {
                        warn!(board_id, "policy configuration can't be set");
                    }
                }
                _ => warn!("{CONFIG_MAP} key was not found in personalities"),
            }
        }
        None => warn!("board-id is unknown, leaving policy configuration alone"),
    }

    let result = original(policy);
    debug!(result, "AppleGraphicsDevicePolicy::start returned");
    result
}

/// `NVDAStartupWeb::probe`: when compatibility is forced on, makes the driver's required OS
/// match the running build before it checks it
pub fn nvdastartup_probe<S: Service + ?Sized, R>(
    original: Option<impl FnOnce(&mut S) -> R>,
    startup: &mut S,
    force_compatibility: Option<bool>,
    os_build: Option<&str>,
) -> Option<R> {
    let original = original?;

    if force_compatibility == Some(true) {
        match os_build {
            Some(build) => {
                if startup.set_property(REQUIRED_OS, Value::String(build.to_string())) {
                    debug!(build, "forced {REQUIRED_OS}");
                } else {
                    warn!(build, "unable to set {REQUIRED_OS}");
                }
            }
            None => warn!("OS build is unknown, unable to force compatibility"),
        }
    }

    Some(original(startup))
}

/// `nvVirtualAddressSpace::PreSubmit` as called from the fifo `Prepare`: skips the per-submit
/// address space work that newer drivers added and reports success, as older drivers did
pub fn presubmit(original: Option<impl FnOnce() -> bool>, legacy: bool) -> bool {
    match original {
        Some(original) if !legacy => original(),
        _ => true,
    }
}
