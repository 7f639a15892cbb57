//! Host resolution
//!
//! The engine only consumes IPv4 addresses; everything about name lookup
//! beyond "give me an A record" is the platform resolver's business.

use sonda_common::{Destination, Error};
use std::net::{IpAddr, Ipv4Addr};
use tracing::info;

/// Resolve a hostname or IPv4 literal to a [`Destination`].
///
/// Literals short-circuit without touching the resolver. Lookup failures
/// and hosts with no A records both surface as [`Error::Resolution`]; the
/// caller decides whether to retry, the engine never does.
pub async fn resolve_ipv4(host: &str) -> Result<Destination, Error> {
    if let Ok(address) = host.parse::<Ipv4Addr>() {
        return Ok(Destination::new(host, address));
    }

    let addresses = tokio::net::lookup_host((host, 0u16))
        .await
        .map_err(|e| Error::Resolution {
            host: host.to_string(),
            message: e.to_string(),
        })?;

    let address = addresses
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| Error::Resolution {
            host: host.to_string(),
            message: "no IPv4 address records".to_string(),
        })?;

    info!(host, address = %address, "resolved destination");
    Ok(Destination::new(host, address))
}
