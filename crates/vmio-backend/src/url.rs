//! Image URLs
//!
//! A ticket locates its backing store with a URL: `file:` for local
//! files and block devices, `nbd:` for NBD exports, and `https:` or
//! `http:` for a remote vmio daemon.

use std::path::PathBuf;

use vmio_common::{Error, Result};
use vmio_nbd::NbdUrl;

use crate::http::RemoteUrl;

/// A parsed backing-store URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageUrl {
    File(PathBuf),
    Nbd(NbdUrl),
    Remote(RemoteUrl),
}

impl ImageUrl {
    /// URL scheme name, used to select backend configuration.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Nbd(_) => "nbd",
            Self::Remote(_) => "https",
        }
    }
}

impl std::str::FromStr for ImageUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("file:") {
            // Accept file:/path, file:///path, and file://localhost/path
            // like forms; the path always starts at the first single /.
            let path = rest.strip_prefix("//").map_or(rest, |rest| {
                rest.find('/').map_or("", |i| &rest[i..])
            });
            if !path.starts_with('/') {
                return Err(Error::invalid_argument(format!("unsupported file URL: {s}")));
            }
            return Ok(Self::File(PathBuf::from(path)));
        }

        if s.starts_with("nbd:") {
            let url: NbdUrl = s
                .parse()
                .map_err(|err| Error::invalid_argument(format!("{err}")))?;
            return Ok(Self::Nbd(url));
        }

        if s.starts_with("https:") || s.starts_with("http:") {
            return Ok(Self::Remote(s.parse()?));
        }

        Err(Error::invalid_argument(format!("unsupported URL: {s}")))
    }
}

impl std::fmt::Display for ImageUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Nbd(url) => write!(f, "{}", url.address.url(&url.export)),
            Self::Remote(url) => write!(f, "{url}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmio_nbd::Address;

    #[test]
    fn test_parse_file() {
        let url: ImageUrl = "file:/var/tmp/disk.img".parse().unwrap();
        assert_eq!(url, ImageUrl::File(PathBuf::from("/var/tmp/disk.img")));

        let url: ImageUrl = "file:///var/tmp/disk.img".parse().unwrap();
        assert_eq!(url, ImageUrl::File(PathBuf::from("/var/tmp/disk.img")));
    }

    #[test]
    fn test_parse_nbd() {
        let url: ImageUrl = "nbd:unix:/run/vdsm/nbd.sock".parse().unwrap();
        match url {
            ImageUrl::Nbd(nbd) => {
                assert_eq!(nbd.address, Address::unix("/run/vdsm/nbd.sock"));
            }
            other => panic!("unexpected url {other:?}"),
        }
    }

    #[test]
    fn test_parse_remote() {
        let url: ImageUrl = "https://server:54322/images/ticket-id".parse().unwrap();
        match &url {
            ImageUrl::Remote(remote) => {
                assert_eq!(remote.host, "server");
                assert_eq!(remote.port, 54322);
                assert_eq!(remote.path, "/images/ticket-id");
                assert!(remote.tls);
            }
            other => panic!("unexpected url {other:?}"),
        }
        assert_eq!(url.scheme(), "https");
    }

    #[test]
    fn test_parse_invalid() {
        assert!("ftp://server/file".parse::<ImageUrl>().is_err());
        assert!("file:relative".parse::<ImageUrl>().is_err());
    }
}
