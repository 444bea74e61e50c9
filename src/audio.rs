//! # Audio
//!
//! HDMI audio properties for NVIDIA cards. The audio function only shows up with working
//! outputs when the graphics device advertises digital connectors and both sides agree on the
//! `hda-gfx` pairing.

use tracing::debug;

use crate::config::Configuration;
use crate::service::{Service, Value};

/// PCI vendor ids of graphics vendors with HDMI audio
#[allow(missing_docs)]
pub mod vendor {
    pub const ATI_AMD: u16 = 0x1002;
    pub const NVIDIA: u16 = 0x10de;
    pub const INTEL: u16 = 0x8086;
}

/// Number of `@N,connector-type` entries added to the graphics device
pub const MAX_CONNECTOR_COUNT: usize = 6;

/// DisplayPort connector type
pub const CONNECTOR_TYPE: [u8; 4] = [0x00, 0x08, 0x00, 0x00];

/// Pairing value shared by the graphics device and its audio function
pub const HDA_GFX: &[u8] = b"onboard-1\0";

/// Reads a little endian PCI id property
fn pci_id<S: Service + ?Sized>(device: &S, key: &str) -> Option<u16> {
    match device.property(key)?.as_data()? {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

/// Adds the properties that make the NVIDIA HDMI audio function usable.
///
/// `analog_layout` is the `layout-id` of the analog codec, copied to the HDMI function when it
/// has none. Returns `true` if the audio function belongs to an NVIDIA card and was updated.
pub fn inject_hdmi_properties<G, A>(
    config: &Configuration,
    gpu: &mut G,
    audio: &mut A,
    analog_layout: Option<u32>,
) -> bool
where
    G: Service + ?Sized,
    A: Service + ?Sized,
{
    if config.disabled || config.no_audio_fixes {
        return false;
    }
    let id = pci_id(audio, "vendor-id");
    if id != Some(vendor::NVIDIA) {
        debug!(vendor = ?id, "not an NVIDIA audio function");
        return false;
    }

    if !config.no_audio_connectors {
        for i in 0..MAX_CONNECTOR_COUNT {
            let key = format!("@{i},connector-type");
            if gpu.property(&key).is_none() {
                gpu.set_property(&key, Value::Data(CONNECTOR_TYPE.to_vec()));
            }
        }
        debug!("added connector types");
    }

    if gpu.property("hda-gfx").is_none() {
        gpu.set_property("hda-gfx", Value::Data(HDA_GFX.to_vec()));
    }
    if audio.property("hda-gfx").is_none() {
        audio.set_property("hda-gfx", Value::Data(HDA_GFX.to_vec()));
    }

    if let Some(layout) = analog_layout {
        if audio.property("layout-id").is_none()
            && audio.set_property("layout-id", Value::Data(layout.to_le_bytes().to_vec()))
        {
            debug!(layout, "copied analog layout-id");
        }
    }
    true
}
