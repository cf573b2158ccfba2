//! Adapter construction, keyed by protocol.

use crate::config::{Config, Protocol};
use crate::error::CamlinkError;
use crate::protocols::{AdapterEvents, ProtocolAdapter, RtmpAdapter, SrtAdapter, WebRtcAdapter};
use std::sync::Arc;

pub struct AdapterFactory;

impl AdapterFactory {
    /// Build the adapter for `protocol`, wired to the given presence hooks.
    pub fn create(
        protocol: Protocol,
        events: AdapterEvents,
        config: &Config,
    ) -> Result<Arc<dyn ProtocolAdapter>, CamlinkError> {
        Ok(match protocol {
            Protocol::Rtmp => Arc::new(RtmpAdapter::new(events, config)),
            Protocol::Srt => Arc::new(SrtAdapter::new(events, config)),
            Protocol::WebRtc => Arc::new(WebRtcAdapter::new(events, config)?),
        })
    }

    /// Same as [`AdapterFactory::create`] but from a user-supplied name.
    pub fn create_by_name(
        name: &str,
        events: AdapterEvents,
        config: &Config,
    ) -> Result<Arc<dyn ProtocolAdapter>, CamlinkError> {
        Self::create(name.parse()?, events, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_every_supported_protocol() {
        let config = Config::default();
        for protocol in [Protocol::Rtmp, Protocol::Srt, Protocol::WebRtc] {
            let adapter =
                AdapterFactory::create(protocol, AdapterEvents::default(), &config).unwrap();
            assert_eq!(adapter.protocol(), protocol);
        }
    }

    #[test]
    fn name_lookup_is_case_insensitive() {
        let config = Config::default();
        let adapter =
            AdapterFactory::create_by_name("RTMP", AdapterEvents::default(), &config).unwrap();
        assert_eq!(adapter.protocol(), Protocol::Rtmp);
    }

    #[test]
    fn unknown_name_is_rejected() {
        let config = Config::default();
        match AdapterFactory::create_by_name("quic", AdapterEvents::default(), &config) {
            Err(CamlinkError::UnsupportedProtocol(name)) => assert_eq!(name, "quic"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected an unsupported-protocol error"),
        }
    }
}
