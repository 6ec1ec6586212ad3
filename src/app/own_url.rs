//! The URL peers use to reach this instance's private API.

use std::net::{IpAddr, SocketAddr};

use crate::config::OwnPrivateApiConfig;
use crate::errors::Error;

/// Where the private API server actually listens.
#[derive(Debug, Clone)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(String),
}

/// Derive the own URL from explicit settings, a CIDR matched against local
/// interfaces, or the listener address, in that order.
pub fn construct_own_url(cfg: &OwnPrivateApiConfig, listen: &ListenAddr) -> Result<String, Error> {
    construct_with(cfg, listen, interface_addrs)
}

fn construct_with(
    cfg: &OwnPrivateApiConfig,
    listen: &ListenAddr,
    addrs: impl FnOnce() -> Result<Vec<IpAddr>, Error>,
) -> Result<String, Error> {
    if !cfg.url.is_empty() {
        if !cfg.cidr.is_empty() {
            return Err(Error::config(
                "either OWN_PRIVATE_API_URL or OWN_PRIVATE_API_CIDR should be specified, not both",
            ));
        }
        return Ok(cfg.url.clone());
    }
    let port = parse_port(&cfg.port)?;
    let scheme = match cfg.scheme.as_str() {
        "" | "grpc" => "grpc",
        "grpcs" => "grpcs",
        other => {
            return Err(Error::config(format!(
                "OWN_PRIVATE_API_SCHEME: unsupported scheme {other:?}, expected grpc or grpcs"
            )))
        }
    };
    if !cfg.cidr.is_empty() {
        let cidr = Cidr::parse(&cfg.cidr)?;
        let matches: Vec<IpAddr> = addrs()?.into_iter().filter(|ip| cidr.contains(*ip)).collect();
        let ip = match matches.as_slice() {
            [] => {
                return Err(Error::config(format!(
                    "no local IP addresses match OWN_PRIVATE_API_CIDR {}",
                    cfg.cidr
                )))
            }
            [ip] => *ip,
            many => {
                let list: Vec<String> = many.iter().map(ToString::to_string).collect();
                return Err(Error::config(format!(
                    "multiple local IP addresses match OWN_PRIVATE_API_CIDR {}: {}",
                    cfg.cidr,
                    list.join(", ")
                )));
            }
        };
        let port = match (port, listen) {
            (Some(port), _) => port,
            (None, ListenAddr::Tcp(addr)) => addr.port(),
            (None, ListenAddr::Unix(_)) => {
                return Err(Error::config(
                    "OWN_PRIVATE_API_PORT must be specified when the private API listens on a unix socket",
                ))
            }
        };
        return Ok(format!("{scheme}://{}", SocketAddr::new(ip, port)));
    }
    match listen {
        ListenAddr::Tcp(addr) if addr.ip().is_unspecified() => Err(Error::config(format!(
            "private API listens on {addr}; set OWN_PRIVATE_API_URL or OWN_PRIVATE_API_CIDR"
        ))),
        ListenAddr::Tcp(addr) => Ok(format!("{scheme}://{addr}")),
        ListenAddr::Unix(path) => Ok(format!("unix://{path}")),
    }
}

fn parse_port(port: &str) -> Result<Option<u16>, Error> {
    if port.is_empty() {
        return Ok(None);
    }
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(Some(p)),
        _ => Err(Error::config(format!("OWN_PRIVATE_API_PORT: invalid port {port:?}"))),
    }
}

fn interface_addrs() -> Result<Vec<IpAddr>, Error> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| Error::config(format!("failed to list network interfaces: {e}")))?;
    Ok(addrs
        .filter_map(|ifa| {
            let addr = ifa.address?;
            if let Some(v4) = addr.as_sockaddr_in() {
                return Some(IpAddr::V4(v4.ip()));
            }
            addr.as_sockaddr_in6().map(|v6| IpAddr::V6(v6.ip()))
        })
        .collect())
}

struct Cidr {
    net: IpAddr,
    prefix: u32,
}

impl Cidr {
    fn parse(s: &str) -> Result<Self, Error> {
        let invalid = || Error::config(format!("OWN_PRIVATE_API_CIDR: invalid CIDR {s:?}"));
        let (ip, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let net: IpAddr = ip.parse().map_err(|_| invalid())?;
        let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
        let max = if net.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { net, prefix })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.net, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(url: &str, cidr: &str, scheme: &str, port: &str) -> OwnPrivateApiConfig {
        OwnPrivateApiConfig {
            url: url.to_string(),
            cidr: cidr.to_string(),
            port: port.to_string(),
            scheme: scheme.to_string(),
            host: String::new(),
        }
    }

    fn tcp(addr: &str) -> ListenAddr {
        ListenAddr::Tcp(addr.parse().unwrap())
    }

    fn local() -> Result<Vec<IpAddr>, Error> {
        Ok(vec![
            "127.0.0.1".parse().unwrap(),
            "10.1.2.3".parse().unwrap(),
            "192.168.0.7".parse().unwrap(),
            "fd00::5".parse().unwrap(),
        ])
    }

    #[test]
    fn test_explicit_url() {
        let url = construct_with(&cfg("grpc://kas-1:8155", "", "", ""), &tcp("0.0.0.0:8155"), local);
        assert_eq!(url.unwrap(), "grpc://kas-1:8155");
    }

    #[test]
    fn test_url_and_cidr_conflict() {
        let err = construct_with(&cfg("grpc://a:1", "10.0.0.0/8", "", ""), &tcp("0.0.0.0:1"), local)
            .unwrap_err();
        assert!(err.to_string().contains("not both"), "{err}");
    }

    #[test]
    fn test_cidr_match() {
        let url = construct_with(&cfg("", "10.0.0.0/8", "", ""), &tcp("0.0.0.0:8155"), local);
        assert_eq!(url.unwrap(), "grpc://10.1.2.3:8155");

        let url = construct_with(&cfg("", "fd00::/8", "grpcs", "9000"), &tcp("[::]:8155"), local);
        assert_eq!(url.unwrap(), "grpcs://[fd00::5]:9000");
    }

    #[test]
    fn test_cidr_no_or_many_matches() {
        assert!(construct_with(&cfg("", "172.16.0.0/12", "", ""), &tcp("0.0.0.0:1"), local).is_err());
        let err = construct_with(&cfg("", "0.0.0.0/0", "", ""), &tcp("0.0.0.0:1"), local).unwrap_err();
        assert!(err.to_string().contains("multiple"), "{err}");
    }

    #[test]
    fn test_cidr_with_unix_listener_needs_port() {
        let unix = ListenAddr::Unix("/run/kas.sock".to_string());
        assert!(construct_with(&cfg("", "10.0.0.0/8", "", ""), &unix, local).is_err());
        let url = construct_with(&cfg("", "10.0.0.0/8", "", "8155"), &unix, local);
        assert_eq!(url.unwrap(), "grpc://10.1.2.3:8155");
    }

    #[test]
    fn test_listener_fallback() {
        let url = construct_with(&cfg("", "", "", ""), &tcp("127.0.0.1:8155"), local);
        assert_eq!(url.unwrap(), "grpc://127.0.0.1:8155");
        assert!(construct_with(&cfg("", "", "", ""), &tcp("0.0.0.0:8155"), local).is_err());
        let unix = ListenAddr::Unix("/run/kas.sock".to_string());
        assert_eq!(
            construct_with(&cfg("", "", "", ""), &unix, local).unwrap(),
            "unix:///run/kas.sock"
        );
    }

    #[test]
    fn test_bad_port_and_scheme() {
        assert!(construct_with(&cfg("", "", "", "0"), &tcp("127.0.0.1:1"), local).is_err());
        assert!(construct_with(&cfg("", "", "", "70000"), &tcp("127.0.0.1:1"), local).is_err());
        assert!(construct_with(&cfg("", "", "http", ""), &tcp("127.0.0.1:1"), local).is_err());
    }
}
