//! Advertise-address selection.
//!
//! Deduces the best IP on which to advertise the API from a user-provided
//! bind host and advertise host, resolving hostnames where a pure IP is
//! required downstream.

use core::future::Future;
use std::fmt;
use std::io;
use std::net::IpAddr;

use error_stack::{Report, ResultExt};
use tracing::warn;

/// Marker error for advertise-address calculation. Details travel as
/// `error_stack` attachments.
#[derive(Debug)]
pub struct AdvertiseError;

impl fmt::Display for AdvertiseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("could not deduce advertise address")
    }
}

impl std::error::Error for AdvertiseError {}

/// Hostname resolution, injectable for tests.
pub trait Resolver {
    fn lookup_ip(&self, host: &str) -> impl Future<Output = io::Result<Vec<IpAddr>>> + Send;
}

/// The system resolver.
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsResolver;

impl Resolver for DnsResolver {
    async fn lookup_ip(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        let mut ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        ips.dedup();
        Ok(ips)
    }
}

/// Deduce the advertise IP, in order of preference:
///
/// 1. the advertise host, when it parses as an IP (canonicalized to 4-byte
///    form when it is an IPv4);
/// 2. the advertise host, when it resolves to exactly one address; any other
///    outcome logs a warning and falls back to the bind host;
/// 3. the host's private IP, when the bind host is all-zeroes;
/// 4. the bind host, when it parses as an IP;
/// 5. the bind host, when it resolves to exactly one address; anything else
///    is fatal.
pub async fn calculate_advertise_ip<R: Resolver>(
    bind_host: &str,
    advertise_host: &str,
    resolver: &R,
) -> Result<IpAddr, Report<AdvertiseError>> {
    // Prefer the advertise host, if it's given.
    if !advertise_host.is_empty() {
        if let Ok(ip) = advertise_host.parse::<IpAddr>() {
            return Ok(ip.to_canonical());
        }

        match resolver.lookup_ip(advertise_host).await {
            Ok(ips) if ips.len() == 1 => return Ok(ips[0].to_canonical()),
            Ok(ips) => warn!(
                advertise_host,
                resolved = ips.len(),
                "advertise host did not resolve to exactly one IP, falling back to bind host"
            ),
            Err(error) => warn!(
                advertise_host,
                %error,
                "advertise host failed to resolve, falling back to bind host"
            ),
        }
    }

    // An all-zeroes bind host advertises the private IP.
    if bind_host == "0.0.0.0" {
        return local_ip_address::local_ip()
            .change_context(AdvertiseError)
            .attach("failed to deduce private IP from all-zeroes bind address");
    }

    // Otherwise, the bind host itself...
    if let Ok(ip) = bind_host.parse::<IpAddr>() {
        return Ok(ip);
    }

    // ...or whatever it resolves to.
    match resolver.lookup_ip(bind_host).await {
        Ok(ips) if ips.len() == 1 => Ok(ips[0].to_canonical()),
        Ok(ips) => Err(Report::new(AdvertiseError)
            .attach(format!("bind host '{bind_host}' resolved to {} IPs", ips.len()))),
        Err(error) => Err(Report::new(error)
            .change_context(AdvertiseError)
            .attach("bind host failed to resolve")),
    }
}

/// Strip an optional `:port` suffix, including the bracketed IPv6 form.
fn strip_port(hostport: &str) -> &str {
    if let Some(rest) = hostport.strip_prefix('[')
        && let Some(end) = rest.find(']')
    {
        return &rest[..end];
    }
    if hostport.matches(':').count() == 1
        && let Some((host, _port)) = hostport.split_once(':')
    {
        return host;
    }
    hostport
}

/// Whether any entry, after stripping an optional port, is neither a
/// loopback IP nor the literal "localhost".
pub fn has_nonlocal(host_ports: &[impl AsRef<str>]) -> bool {
    host_ports.iter().any(|hostport| {
        let host = strip_port(hostport.as_ref());
        match host.parse::<IpAddr>() {
            Ok(ip) => !ip.is_loopback(),
            Err(_) => !host.eq_ignore_ascii_case("localhost"),
        }
    })
}

/// Whether the address, after stripping an optional port, is an unspecified
/// or loopback IP, or the literal "localhost".
#[must_use]
pub fn is_unroutable(addr: &str) -> bool {
    let host = strip_port(addr);
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_unspecified() || ip.is_loopback(),
        Err(_) => host.eq_ignore_ascii_case("localhost"),
    }
}
