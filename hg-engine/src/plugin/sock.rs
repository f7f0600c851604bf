//! TCP plugin over plain sockets (`sock+tcp`).
//!
//! With `listen` set the class binds a `TcpListener` during init, so the
//! self address carries the real port the kernel picked. Without a host in
//! the transport spec the local interface is chosen from `getifaddrs`,
//! honouring the `ip_subnet` preference and the requested address family.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpListener, ToSocketAddrs};
use tracing::{debug, info};

use super::{NaAddr, NaClass, NaContext, NaInitInfo, NaPlugin};
use crate::error::NaError;
use crate::options::AddrFormat;

const PROTOCOLS: &[&str] = &["tcp"];

pub struct SockPlugin;

impl SockPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SockPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl NaPlugin for SockPlugin {
    fn name(&self) -> &str {
        "sock"
    }

    fn protocols(&self) -> &[&str] {
        PROTOCOLS
    }

    fn initialize(&self, info: &NaInitInfo<'_>) -> Result<Box<dyn NaClass>, NaError> {
        let port = info.spec.port.unwrap_or(0);
        let ip = match &info.spec.host {
            Some(host) => resolve_host(host, port, info.options.addr_format)?,
            None => select_interface(
                info.options.ip_subnet.as_deref(),
                info.options.addr_format,
            )?,
        };

        let (listener, addr) = if info.listen {
            let listener = TcpListener::bind((ip, port))?;
            listener.set_nonblocking(true)?;
            let addr = listener.local_addr()?;
            info!(%addr, "sock+tcp listening");
            (Some(listener), addr)
        } else {
            (None, SocketAddr::new(ip, port))
        };

        Ok(Box::new(SockClass {
            _listener: listener,
            addr,
        }))
    }
}

struct SockClass {
    _listener: Option<TcpListener>,
    addr: SocketAddr,
}

impl NaClass for SockClass {
    fn protocol(&self) -> &str {
        "tcp"
    }

    fn addr_self(&self) -> Result<NaAddr, NaError> {
        Ok(NaAddr::new(format!("sock+tcp://{}", self.addr)))
    }

    fn context_create(&self) -> Result<Box<dyn NaContext>, NaError> {
        Ok(Box::new(SockContext))
    }
}

struct SockContext;

impl NaContext for SockContext {}

fn family_ok(ip: &IpAddr, format: AddrFormat) -> bool {
    match format {
        AddrFormat::Ipv4 => ip.is_ipv4(),
        AddrFormat::Ipv6 => ip.is_ipv6(),
        AddrFormat::Unspec | AddrFormat::Native => true,
    }
}

fn resolve_host(host: &str, port: u16, format: AddrFormat) -> Result<IpAddr, NaError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    (host, port)
        .to_socket_addrs()?
        .map(|sa| sa.ip())
        .find(|ip| family_ok(ip, format))
        .ok_or_else(|| NaError::AddrNotAvailable(format!("cannot resolve host '{host}'")))
}

/// Pick the local address to advertise.
///
/// With a subnet preference the first matching interface address wins and
/// no match is an error. Otherwise the first non-loopback address of the
/// right family is used, falling back to loopback.
fn select_interface(subnet: Option<&str>, format: AddrFormat) -> Result<IpAddr, NaError> {
    let candidates: Vec<IpAddr> = nix::ifaddrs::getifaddrs()
        .map_err(std::io::Error::from)?
        .filter_map(|ifa| {
            let sa = ifa.address?;
            if let Some(sin) = sa.as_sockaddr_in() {
                Some(IpAddr::V4(*SocketAddrV4::from(*sin).ip()))
            } else {
                sa.as_sockaddr_in6()
                    .map(|sin6| IpAddr::V6(*SocketAddrV6::from(*sin6).ip()))
            }
        })
        .filter(|ip| family_ok(ip, format))
        .collect();
    debug!(count = candidates.len(), "interface addresses found");

    if let Some(subnet) = subnet {
        return candidates
            .into_iter()
            .find(|ip| subnet_matches(ip, subnet))
            .ok_or_else(|| {
                NaError::AddrNotAvailable(format!("no interface matches subnet '{subnet}'"))
            });
    }

    Ok(candidates
        .into_iter()
        .find(|ip| !ip.is_loopback())
        .unwrap_or(match format {
            AddrFormat::Ipv6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
            _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
        }))
}

/// Match `ip` against a subnet given either as CIDR ("10.92.0.0/16") or as
/// a textual prefix ("10.92").
pub(crate) fn subnet_matches(ip: &IpAddr, subnet: &str) -> bool {
    let Some((net, bits)) = subnet.split_once('/') else {
        return ip.to_string().starts_with(subnet);
    };
    let (Ok(net), Ok(bits)) = (net.parse::<IpAddr>(), bits.parse::<u32>()) else {
        return false;
    };
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) if bits <= 32 => {
            let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
            u32::from(*ip) & mask == u32::from(net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) if bits <= 128 => {
            let mask = u128::MAX.checked_shl(128 - bits).unwrap_or(0);
            u128::from(*ip) & mask == u128::from(net) & mask
        }
        _ => false,
    }
}
