use log::warn;
use serde::Serialize;

use crate::audio::{DeviceInfo, Interface};
use crate::models::ApiType;

/// Devices of one backend, or why it could not be listed
#[derive(Debug, Clone, Serialize)]
pub struct BackendListing {
    pub api: ApiType,
    pub devices: Vec<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything `orchestra-list` reports
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceListing {
    pub backends: Vec<BackendListing>,
}

/// Instantiate each backend in `apis` on `interface` and probe its devices.
/// A backend that fails is reported, not fatal.
pub fn collect_listing(interface: &mut Interface, apis: &[ApiType]) -> DeviceListing {
    let backends = apis
        .iter()
        .map(|&api| {
            let probed = interface
                .instantiate(Some(api))
                .and_then(|_| interface.probe_devices());
            match probed {
                Ok(devices) => BackendListing {
                    api,
                    devices,
                    error: None,
                },
                Err(e) => {
                    warn!("cannot list backend '{}': {}", api, e);
                    BackendListing {
                        api,
                        devices: Vec::new(),
                        error: Some(e.user_message()),
                    }
                }
            }
        })
        .collect();
    DeviceListing { backends }
}

impl DeviceListing {
    pub fn device_count(&self) -> usize {
        self.backends.iter().map(|backend| backend.devices.len()).sum()
    }

    pub fn render_text(&self) -> String {
        let mut text = String::new();
        for backend in &self.backends {
            match &backend.error {
                Some(error) => {
                    text.push_str(&format!("API: {} (unavailable: {})\n", backend.api, error));
                }
                None => {
                    text.push_str(&format!(
                        "API: {} ({} device{})\n",
                        backend.api,
                        backend.devices.len(),
                        if backend.devices.len() == 1 { "" } else { "s" }
                    ));
                }
            }
            for device in &backend.devices {
                text.push_str(&format!("  [{}] {}\n", device.id, device.name));
                text.push_str(&device.display(2));
                text.push('\n');
            }
            text.push('\n');
        }
        text
    }

    pub fn render_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
