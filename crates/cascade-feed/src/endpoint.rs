//! Downstream routing endpoints.
//!
//! An endpoint is a live transport handle to one downstream address. The
//! feed keeps a table keyed by both the address a router advertised and
//! its canonical (resolved) form, so callers may refer to either; the two
//! keys share one transport.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use async_trait::async_trait;
use cascade_common::{Error, Result};

/// Live transport handle to one downstream address.
#[async_trait]
pub trait RouterEndpoint: Send + Sync {
    /// Liveness probe. A `false` return prompts a restart through the
    /// factory.
    fn ping(&self) -> bool;

    /// Tear down the transport. Must tolerate repeated calls.
    async fn close(&self) -> Result<()>;

    /// Transport-level statistics document.
    fn statistics(&self) -> serde_json::Value;
}

/// Constructs endpoints on demand.
#[async_trait]
pub trait RouterEndpointFactory: Send + Sync {
    async fn create(
        &self,
        topic: &str,
        endpoint_type: &str,
        raddr: &str,
    ) -> Result<Arc<dyn RouterEndpoint>>;
}

/// Remote address to live endpoint. Shared by reference with every
/// data-path worker the feed owns.
pub type EndpointTable = HashMap<String, Arc<dyn RouterEndpoint>>;

fn resolve(raddr: &str) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = raddr
        .to_socket_addrs()
        .map_err(|e| Error::Endpoint(format!("resolve {raddr}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Endpoint(format!("resolve {raddr}: no address")));
    }
    Ok(addrs)
}

/// Normalise `raddr` against the currently-known endpoint addresses. If a
/// known address resolves to any of the same socket addresses, that known
/// form is the canonical one.
pub(crate) fn equivalent_addr(raddr: &str, known: &[String]) -> Result<String> {
    let targets = resolve(raddr)?;
    for addr in known {
        if addr == raddr {
            return Ok(addr.clone());
        }
        if let Ok(resolved) = resolve(addr) {
            if resolved.iter().any(|a| targets.contains(a)) {
                return Ok(addr.clone());
            }
        }
    }
    Ok(raddr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_addr_is_its_own_canonical_form() {
        let canonical = equivalent_addr("localhost:9104", &[]).unwrap();
        assert_eq!(canonical, "localhost:9104");
    }

    #[test]
    fn equivalent_addr_reuses_known_spelling() {
        let known = vec!["localhost:9104".to_string()];
        let canonical = equivalent_addr("127.0.0.1:9104", &known).unwrap();
        assert_eq!(canonical, "localhost:9104");
    }

    #[test]
    fn different_port_is_not_equivalent() {
        let known = vec!["localhost:9104".to_string()];
        let canonical = equivalent_addr("localhost:9105", &known).unwrap();
        assert_eq!(canonical, "localhost:9105");
    }

    #[test]
    fn unresolvable_addr_is_an_error() {
        assert!(equivalent_addr("no-port-here", &[]).is_err());
    }
}
