//! NBD addresses and URLs
//!
//! An NBD server listens on a Unix socket or a TCP address. URLs come
//! in three forms:
//!
//! - `nbd://host:port[/export]` - the leading `/` of the path is not
//!   part of the export name; `//` preserves a leading `/`.
//! - `nbd:unix:/path[:exportname=NAME]`
//! - `nbd:host:port[:exportname=NAME]`

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A transport address for an NBD server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl Address {
    #[must_use]
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Self::Unix(path.as_ref().to_path_buf())
    }

    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Format the qemu-style NBD URL for this address.
    #[must_use]
    pub fn url(&self, export: &str) -> String {
        let mut s = match self {
            Self::Unix(path) => format!("nbd:unix:{}", path.display()),
            Self::Tcp { host, port } => {
                // Numeric IPv6 addresses must be bracket quoted.
                if host.contains(':') {
                    format!("nbd:[{host}]:{port}")
                } else {
                    format!("nbd:{host}:{port}")
                }
            }
        };
        if !export.is_empty() {
            s.push_str(":exportname=");
            s.push_str(export);
        }
        s
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
        }
    }
}

/// A parsed NBD URL: transport address plus export name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NbdUrl {
    pub address: Address,
    pub export: String,
}

impl NbdUrl {
    #[must_use]
    pub fn new(address: Address, export: impl Into<String>) -> Self {
        Self {
            address,
            export: export.into(),
        }
    }
}

impl std::str::FromStr for NbdUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // The nice URL notation: nbd://localhost:10809/sda. Less
        // flexible but nicer for humans.
        if let Some(rest) = s.strip_prefix("nbd://") {
            let (authority, path) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, ""),
            };
            let (host, port) = split_host_port(authority)
                .ok_or_else(|| Error::InvalidUrl(s.to_string()))?;
            // The / starting the path component is not part of the
            // export name. An export name with a leading / requires //.
            let export = path.strip_prefix('/').unwrap_or(path);
            return Ok(Self::new(Address::tcp(host, port), export));
        }

        // The qemu device notation, which can express any export name:
        // nbd:unix:path[:exportname=name] or nbd:host:port[:exportname=name].
        if let Some(rest) = s.strip_prefix("nbd:") {
            let (rest, export) = match rest.find(":exportname=") {
                Some(i) => (&rest[..i], &rest[i + ":exportname=".len()..]),
                None => (rest, ""),
            };

            if let Some(path) = rest.strip_prefix("unix:") {
                if !path.starts_with('/') {
                    return Err(Error::InvalidUrl(s.to_string()));
                }
                return Ok(Self::new(Address::unix(path), export));
            }

            let (host, port) = split_host_port(rest)
                .ok_or_else(|| Error::InvalidUrl(s.to_string()))?;
            return Ok(Self::new(Address::tcp(host, port), export));
        }

        Err(Error::InvalidUrl(s.to_string()))
    }
}

/// Split "host:port", unquoting a bracketed IPv6 host.
fn split_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nice_url() {
        let url: NbdUrl = "nbd://localhost:10809/sda".parse().unwrap();
        assert_eq!(url.address, Address::tcp("localhost", 10809));
        assert_eq!(url.export, "sda");
    }

    #[test]
    fn test_parse_nice_url_no_export() {
        let url: NbdUrl = "nbd://localhost:10809".parse().unwrap();
        assert_eq!(url.export, "");
        let url: NbdUrl = "nbd://localhost:10809/".parse().unwrap();
        assert_eq!(url.export, "");
    }

    #[test]
    fn test_parse_nice_url_leading_slash_export() {
        // // preserves a leading / in the export name.
        let url: NbdUrl = "nbd://localhost:10809//dev/sda".parse().unwrap();
        assert_eq!(url.export, "/dev/sda");
    }

    #[test]
    fn test_parse_nice_url_ipv6() {
        let url: NbdUrl = "nbd://[::1]:10809/sda".parse().unwrap();
        assert_eq!(url.address, Address::tcp("::1", 10809));
    }

    #[test]
    fn test_parse_unix_url() {
        let url: NbdUrl = "nbd:unix:/run/nbd.sock".parse().unwrap();
        assert_eq!(url.address, Address::unix("/run/nbd.sock"));
        assert_eq!(url.export, "");

        let url: NbdUrl = "nbd:unix:/run/nbd.sock:exportname=sda".parse().unwrap();
        assert_eq!(url.address, Address::unix("/run/nbd.sock"));
        assert_eq!(url.export, "sda");
    }

    #[test]
    fn test_parse_tcp_url() {
        let url: NbdUrl = "nbd:localhost:10809".parse().unwrap();
        assert_eq!(url.address, Address::tcp("localhost", 10809));
        assert_eq!(url.export, "");

        let url: NbdUrl = "nbd:localhost:10809:exportname=sda".parse().unwrap();
        assert_eq!(url.export, "sda");
    }

    #[test]
    fn test_parse_invalid() {
        assert!("file:/tmp/image".parse::<NbdUrl>().is_err());
        assert!("nbd:unix:relative/path".parse::<NbdUrl>().is_err());
        assert!("nbd://localhost:notaport/x".parse::<NbdUrl>().is_err());
    }

    #[test]
    fn test_url_round_trip() {
        let addr = Address::unix("/run/nbd.sock");
        assert_eq!(addr.url("sda"), "nbd:unix:/run/nbd.sock:exportname=sda");
        let parsed: NbdUrl = addr.url("sda").parse().unwrap();
        assert_eq!(parsed.address, addr);
        assert_eq!(parsed.export, "sda");

        let addr = Address::tcp("::1", 10809);
        assert_eq!(addr.url(""), "nbd:[::1]:10809");
        let parsed: NbdUrl = addr.url("").parse().unwrap();
        assert_eq!(parsed.address, addr);
    }
}
