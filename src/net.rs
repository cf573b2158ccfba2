//! Local-network helpers: address enumeration and mDNS advertisement.

use anyhow::{Context, anyhow};
use local_ip_address::{list_afinet_netifas, local_ip};
use log::{info, warn};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::net::IpAddr;

/// Service type advertised for zero-configuration discovery of the WebRTC
/// signaling endpoint.
pub const DISCOVERY_SERVICE_TYPE: &str = "_camlink._tcp.local.";

/// Non-loopback IPv4 addresses of this host, for building connection URLs.
pub fn local_ipv4_addresses() -> Vec<IpAddr> {
    let mut addresses: Vec<IpAddr> = match list_afinet_netifas() {
        Ok(netifas) => netifas
            .into_iter()
            .map(|(_, ip)| ip)
            .filter(|ip| ip.is_ipv4() && !ip.is_loopback())
            .collect(),
        Err(e) => {
            warn!("failed to enumerate network interfaces: {}", e);
            Vec::new()
        }
    };

    if addresses.is_empty()
        && let Ok(ip) = local_ip()
        && !ip.is_loopback()
    {
        addresses.push(ip);
    }

    addresses.sort();
    addresses.dedup();
    addresses
}

/// Running mDNS advertisement; unregisters on drop via [`Advertisement::shutdown`].
pub struct Advertisement {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Advertisement {
    /// Register `instance` under [`DISCOVERY_SERVICE_TYPE`] on the local
    /// network so senders can discover the endpoint without an address.
    pub fn register(instance: &str, port: u16) -> anyhow::Result<Advertisement> {
        let ip = local_ip().context("no usable local IP for mDNS advertisement")?;
        let host_name = format!("{}.local.", ip);
        let properties = [("protocol", "webrtc"), ("path", "/webrtc")];

        let daemon = ServiceDaemon::new().map_err(|e| anyhow!("mdns daemon: {e}"))?;
        let service = ServiceInfo::new(
            DISCOVERY_SERVICE_TYPE,
            instance,
            &host_name,
            ip,
            port,
            &properties[..],
        )
        .map_err(|e| anyhow!("mdns service info: {e}"))?;

        let fullname = service.get_fullname().to_string();
        daemon
            .register(service)
            .map_err(|e| anyhow!("mdns register: {e}"))?;

        info!("mDNS service registered: {} at {}:{}", fullname, ip, port);
        Ok(Advertisement { daemon, fullname })
    }

    /// Unregister the service and shut the daemon down.
    pub fn shutdown(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!("failed to unregister mDNS service: {}", e);
        }
        let _ = self.daemon.shutdown();
        info!("mDNS service unregistered");
    }
}
