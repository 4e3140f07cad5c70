//! OpenDAL Operator factory for log endpoints

use anyhow::{Context, Result};
use opendal::Operator;
use std::fmt;

/// Resolved network address of one logical endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddr {
    pub key: String,
    pub host: String,
    pub port: u16,
}

impl EndpointAddr {
    pub fn new(key: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            key: key.into(),
            host: host.into(),
            port,
        }
    }

    pub fn ftp_url(&self) -> String {
        format!("ftp://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.key, self.host, self.port)
    }
}

/// Builds the operator behind an endpoint. Swapped out in tests for the
/// in-memory service.
pub trait OperatorFactory: Send + Sync {
    fn build(&self, addr: &EndpointAddr) -> Result<Operator>;
}

impl<F> OperatorFactory for F
where
    F: Fn(&EndpointAddr) -> Result<Operator> + Send + Sync,
{
    fn build(&self, addr: &EndpointAddr) -> Result<Operator> {
        self(addr)
    }
}

/// Build an OpenDAL Operator for an anonymous FTP log server.
///
/// No RetryLayer: retry policy belongs to the transfer state machine
/// (timeouts retry after a fixed delay, connection errors never retry).
pub fn build_ftp_operator(addr: &EndpointAddr) -> Result<Operator> {
    if addr.host.is_empty() {
        anyhow::bail!("endpoint {} has no host", addr.key);
    }

    // opendal 0.55: builders use the consuming pattern
    let builder = opendal::services::Ftp::default()
        .endpoint(&addr.ftp_url())
        .user("anonymous")
        .password("");

    let op = Operator::new(builder)
        .with_context(|| format!("creating OpenDAL FTP operator for {addr}"))?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();

    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ftp_operator_valid() {
        let addr = EndpointAddr::new("main", "127.0.0.1", 30021);
        assert_eq!(addr.ftp_url(), "ftp://127.0.0.1:30021");
        let op = build_ftp_operator(&addr);
        assert!(op.is_ok(), "operator construction should succeed");
    }

    #[test]
    fn test_build_ftp_operator_without_host() {
        let addr = EndpointAddr::new("cam", "", 30021);
        let result = build_ftp_operator(&addr);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("no host"));
    }

    #[test]
    fn closures_are_factories() {
        let factory = |_: &EndpointAddr| -> Result<Operator> {
            Ok(Operator::new(opendal::services::Memory::default())?.finish())
        };
        let addr = EndpointAddr::new("main", "10.0.0.1", 21);
        assert!(factory.build(&addr).is_ok());
    }
}
