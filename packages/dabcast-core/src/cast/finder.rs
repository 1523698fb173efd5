//! mDNS discovery of the configured cast device.
//!
//! Browses `_googlecast._tcp.local.` until a device whose `fn` TXT record
//! matches the configured friendly name shows up. Discovery has no timeout:
//! the bridge waits as long as it takes for the device to appear on the
//! network (e.g. after a power cycle), and is cancelled from outside.

use async_trait::async_trait;
use mdns_sd::{ScopedIp, ServiceDaemon, ServiceEvent};

use crate::cast::caster::DeviceFinder;
use crate::cast::device::CastAddr;

/// Google Cast mDNS service type (trailing dot required by mdns-sd).
const GOOGLECAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// TXT record carrying the device's friendly name.
const FRIENDLY_NAME_PROPERTY: &str = "fn";

/// Waits for a cast device with a specific friendly name to appear.
pub struct CastFinder {
    device_name: String,
}

impl CastFinder {
    pub fn new(device_name: &str) -> Self {
        Self {
            device_name: device_name.to_string(),
        }
    }
}

#[async_trait]
impl DeviceFinder for CastFinder {
    async fn find_device(&self) -> Option<CastAddr> {
        let daemon = match ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(e) => {
                log::error!("[CastFinder] failed to create mDNS daemon: {}", e);
                return None;
            }
        };
        let receiver = match daemon.browse(GOOGLECAST_SERVICE_TYPE) {
            Ok(receiver) => receiver,
            Err(e) => {
                log::error!("[CastFinder] failed to browse: {}", e);
                return None;
            }
        };

        let mut found = None;
        while let Ok(event) = receiver.recv_async().await {
            if let ServiceEvent::ServiceResolved(info) = event {
                let friendly_name = info
                    .txt_properties
                    .get_property_val_str(FRIENDLY_NAME_PROPERTY)
                    .unwrap_or_default()
                    .to_string();
                log::debug!(
                    "[CastFinder] resolved cast device '{}' ({})",
                    friendly_name,
                    info.fullname
                );
                if friendly_name != self.device_name {
                    continue;
                }
                // Prefer IPv4; cast devices announce both families.
                let ip = info.addresses.iter().find_map(|addr| match addr {
                    ScopedIp::V4(v4) => Some(v4.addr().to_string()),
                    _ => None,
                });
                if let Some(host) = ip {
                    log::info!(
                        "[CastFinder] found '{}' at {}:{}",
                        friendly_name,
                        host,
                        info.port
                    );
                    found = Some(CastAddr {
                        host,
                        port: info.port,
                        friendly_name,
                    });
                    break;
                }
            }
        }

        if let Err(e) = daemon.stop_browse(GOOGLECAST_SERVICE_TYPE) {
            log::warn!("[CastFinder] failed to stop browse: {:?}", e);
        }
        found
    }
}
