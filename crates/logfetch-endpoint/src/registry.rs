//! Registry of logical log servers keyed by short names ("main", "cam").
//!
//! The registry is an explicit value handed to whoever needs endpoints. It
//! keeps one shared, lazily connected `Endpoint` per key for listing and hands
//! out detached endpoints for transfers, which never share a connection.

use logfetch_core::config::{EndpointConfig, LogFetchConfig};
use logfetch_core::{LogFetchError, LogFetchResult};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::endpoint::{Endpoint, Timeouts};
use crate::operator::{build_ftp_operator, EndpointAddr, OperatorFactory};

struct Slot {
    addr: EndpointAddr,
    available: AtomicBool,
    shared: Mutex<Option<Arc<Endpoint>>>,
}

pub struct EndpointRegistry {
    slots: Vec<Slot>,
    factory: Arc<dyn OperatorFactory>,
    timeouts: Timeouts,
}

impl EndpointRegistry {
    /// FTP-backed registry for the configured endpoints.
    pub fn from_config(config: &LogFetchConfig) -> LogFetchResult<Self> {
        Self::with_factory(
            &config.endpoints,
            Timeouts::from(&config.download),
            Arc::new(build_ftp_operator),
        )
    }

    pub fn with_factory(
        endpoints: &[EndpointConfig],
        timeouts: Timeouts,
        factory: Arc<dyn OperatorFactory>,
    ) -> LogFetchResult<Self> {
        let mut slots: Vec<Slot> = Vec::with_capacity(endpoints.len());
        for cfg in endpoints {
            if slots.iter().any(|s| s.addr.key == cfg.key) {
                return Err(LogFetchError::Config(format!(
                    "duplicate endpoint key: {}",
                    cfg.key
                )));
            }
            let host = resolve_host(cfg, endpoints)?;
            let available = cfg.available && !host.is_empty();
            if host.is_empty() {
                warn!(endpoint = %cfg.key, "endpoint has no usable host, marking unavailable");
            }
            slots.push(Slot {
                addr: EndpointAddr::new(cfg.key.clone(), host, cfg.port),
                available: AtomicBool::new(available),
                shared: Mutex::new(None),
            });
        }
        Ok(Self {
            slots,
            factory,
            timeouts,
        })
    }

    /// Keys in configuration order
    pub fn keys(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.addr.key.clone()).collect()
    }

    pub fn addr(&self, key: &str) -> Option<&EndpointAddr> {
        self.slot(key).map(|s| &s.addr)
    }

    pub fn is_available(&self, key: &str) -> bool {
        self.slot(key)
            .map(|s| s.available.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Returns false for unknown keys.
    pub fn set_available(&self, key: &str, available: bool) -> bool {
        match self.slot(key) {
            Some(s) if !s.addr.host.is_empty() || !available => {
                s.available.store(available, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Keys listing should contact, in configuration order
    pub fn available_keys(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| s.available.load(Ordering::SeqCst))
            .map(|s| s.addr.key.clone())
            .collect()
    }

    /// The shared listing connection for `key`, created on first use.
    pub fn shared(&self, key: &str) -> Option<Arc<Endpoint>> {
        let slot = self.slot(key)?;
        let mut shared = slot.shared.lock().unwrap();
        let ep = shared.get_or_insert_with(|| {
            Arc::new(Endpoint::new(
                slot.addr.clone(),
                self.factory.clone(),
                self.timeouts,
            ))
        });
        Some(ep.clone())
    }

    /// A fresh endpoint for `key` that shares nothing with other users.
    pub fn detached(&self, key: &str) -> Option<Endpoint> {
        let slot = self.slot(key)?;
        Some(Endpoint::new(
            slot.addr.clone(),
            self.factory.clone(),
            self.timeouts,
        ))
    }

    /// Drop every shared listing connection.
    pub fn disconnect_all(&self) {
        for slot in &self.slots {
            if let Some(ep) = slot.shared.lock().unwrap().as_ref() {
                ep.disconnect();
            }
        }
    }

    fn slot(&self, key: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.addr.key == key)
    }
}

fn resolve_host(cfg: &EndpointConfig, all: &[EndpointConfig]) -> LogFetchResult<String> {
    if let Some(host) = &cfg.host {
        return Ok(host.clone());
    }
    let Some(source_key) = &cfg.derive_from else {
        return Ok(String::new());
    };
    let source = all
        .iter()
        .find(|c| &c.key == source_key)
        .ok_or_else(|| {
            LogFetchError::Config(format!(
                "endpoint {} derives from unknown endpoint {source_key}",
                cfg.key
            ))
        })?;
    let source_host = source.host.as_deref().unwrap_or_default();
    Ok(offset_ipv4_host(source_host, cfg.octet_offset).unwrap_or_default())
}

/// Add `offset` to the last octet of an IPv4 literal.
/// `None` when `host` is not IPv4 or the octet would overflow.
pub fn offset_ipv4_host(host: &str, offset: u8) -> Option<String> {
    let ip: Ipv4Addr = host.trim().parse().ok()?;
    let [a, b, c, d] = ip.octets();
    let last = d.checked_add(offset)?;
    Some(Ipv4Addr::new(a, b, c, last).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendal::Operator;

    fn memory_factory() -> Arc<dyn OperatorFactory> {
        Arc::new(|_: &EndpointAddr| -> anyhow::Result<Operator> {
            Ok(Operator::new(opendal::services::Memory::default())?.finish())
        })
    }

    #[test]
    fn offset_host_derivation() {
        assert_eq!(offset_ipv4_host("10.0.10.120", 3).as_deref(), Some("10.0.10.123"));
        assert_eq!(offset_ipv4_host("10.0.10.254", 3), None);
        assert_eq!(offset_ipv4_host("lauv-xplore-1.local", 3), None);
    }

    #[test]
    fn default_config_resolves_main_and_cam() {
        let config = LogFetchConfig::default();
        let registry =
            EndpointRegistry::with_factory(&config.endpoints, Timeouts::default(), memory_factory())
                .unwrap();

        assert_eq!(registry.keys(), vec!["main", "cam"]);
        assert_eq!(registry.addr("cam").unwrap().host, "127.0.0.4");
        assert_eq!(registry.available_keys(), vec!["main"]);

        assert!(registry.set_available("cam", true));
        assert_eq!(registry.available_keys(), vec!["main", "cam"]);
        assert!(!registry.set_available("nope", true));
    }

    #[test]
    fn hostless_endpoint_cannot_become_available() {
        let endpoints = vec![
            EndpointConfig {
                host: Some("vehicle.local".into()),
                ..Default::default()
            },
            EndpointConfig {
                key: "cam".into(),
                host: None,
                derive_from: Some("main".into()),
                octet_offset: 3,
                available: true,
                ..Default::default()
            },
        ];
        let registry =
            EndpointRegistry::with_factory(&endpoints, Timeouts::default(), memory_factory())
                .unwrap();
        assert!(!registry.is_available("cam"));
        assert!(!registry.set_available("cam", true));
    }

    #[test]
    fn duplicate_and_dangling_keys_rejected() {
        let dup = vec![EndpointConfig::default(), EndpointConfig::default()];
        assert!(EndpointRegistry::with_factory(&dup, Timeouts::default(), memory_factory()).is_err());

        let dangling = vec![EndpointConfig {
            key: "cam".into(),
            host: None,
            derive_from: Some("main".into()),
            ..Default::default()
        }];
        let err = EndpointRegistry::with_factory(&dangling, Timeouts::default(), memory_factory())
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown endpoint"));
    }

    #[test]
    fn shared_is_one_per_key_and_detached_is_fresh() {
        let config = LogFetchConfig::default();
        let registry =
            EndpointRegistry::with_factory(&config.endpoints, Timeouts::default(), memory_factory())
                .unwrap();
        let a = registry.shared("main").unwrap();
        let b = registry.shared("main").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.detached("main").unwrap();
        assert_eq!(c.key(), "main");
        assert!(registry.shared("missing").is_none());
    }
}
