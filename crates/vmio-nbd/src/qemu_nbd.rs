//! qemu-nbd supervisor
//!
//! Launches a qemu-nbd child process exposing a local disk image as an
//! NBD export. Used by the client upload/download path to adapt
//! arbitrary image formats to NBD, and by tests to act as the remote
//! end.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::{Value, json};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::addr::{Address, NbdUrl};
use crate::error::{Error, Result};

/// Interval between connect attempts while waiting for the socket.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Path of the qemu-nbd binary, overridable for builds from source.
fn qemu_nbd_binary() -> String {
    std::env::var("QEMU_NBD").unwrap_or_else(|_| "qemu-nbd".to_string())
}

/// Tunables for a qemu-nbd export. See qemu-nbd(8).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Expose the export by this name.
    pub export_name: String,
    pub read_only: bool,
    /// Number of clients that may share the export.
    pub shared: u32,
    /// Cache mode (none, writeback, ...). When unset, probe the image
    /// and use "none" if direct I/O is supported, "writeback" if not.
    pub cache: Option<String>,
    /// AIO mode (native, threads). When unset, "native" if cache is
    /// "none" and "threads" otherwise.
    pub aio: Option<String>,
    pub discard: String,
    /// Conversion of plain zero writes to optimized zero commands;
    /// "unmap" requires discard="unmap".
    pub detect_zeroes: String,
    /// Export this dirty bitmap.
    pub bitmap: Option<String>,
    /// When false, override the qcow2 backing chain to null so
    /// unallocated extents read as zeroes. Requires qemu-nbd >= 5.2.0.
    pub backing_chain: bool,
    /// Expose a range starting at this offset of a raw image.
    pub offset: Option<u64>,
    /// Expose a range of this size of a raw image.
    pub size: Option<u64>,
    /// Deadline for startup and termination.
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            export_name: String::new(),
            read_only: false,
            shared: 8,
            cache: None,
            aio: None,
            discard: "unmap".to_string(),
            detect_zeroes: "unmap".to_string(),
            bitmap: None,
            backing_chain: true,
            offset: None,
            size: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// A supervised qemu-nbd process.
pub struct Server {
    image: PathBuf,
    fmt: String,
    sock: Address,
    config: ServerConfig,
    child: Option<Child>,
}

impl Server {
    #[must_use]
    pub fn new(image: impl AsRef<Path>, fmt: impl Into<String>, sock: Address) -> Self {
        Self::with_config(image, fmt, sock, ServerConfig::default())
    }

    #[must_use]
    pub fn with_config(
        image: impl AsRef<Path>,
        fmt: impl Into<String>,
        sock: Address,
        config: ServerConfig,
    ) -> Self {
        Self {
            image: image.as_ref().to_path_buf(),
            fmt: fmt.into(),
            sock,
            config,
            child: None,
        }
    }

    /// The NBD URL of the running export.
    #[must_use]
    pub fn url(&self) -> NbdUrl {
        NbdUrl::new(self.sock.clone(), self.config.export_name.clone())
    }

    /// Start qemu-nbd and wait until its socket accepts connections.
    pub async fn start(&mut self) -> Result<()> {
        let cache = match &self.config.cache {
            Some(cache) => cache.clone(),
            None => {
                let cache = if self.can_use_direct_io() {
                    "none"
                } else {
                    "writeback"
                };
                debug!("using cache={cache}");
                cache.to_string()
            }
        };

        let aio = match &self.config.aio {
            Some(aio) => aio.clone(),
            None => {
                let aio = if cache == "none" { "native" } else { "threads" };
                debug!("using aio={aio}");
                aio.to_string()
            }
        };

        let args = self.build_args(&cache, &aio, version().await?)?;
        debug!("starting qemu-nbd {args:?}");

        let child = Command::new(qemu_nbd_binary())
            .args(&args)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        self.child = Some(child);

        if !self.wait_for_socket().await {
            self.stop().await;
            return Err(Error::Qemu("timeout waiting for qemu-nbd socket".into()));
        }

        debug!("qemu-nbd socket ready");
        Ok(())
    }

    /// Terminate the child, escalating from SIGTERM to SIGKILL when the
    /// timeout expires.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        debug!("terminating qemu-nbd gracefully");
        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(self.config.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                debug!("qemu-nbd terminated normally");
            }
            Ok(Ok(status)) => {
                warn!("qemu-nbd failed rc={:?}", status.code());
            }
            Ok(Err(err)) => {
                warn!("error waiting for qemu-nbd: {err}");
            }
            Err(_) => {
                warn!("timeout terminating qemu-nbd - killing it");
                let _ = child.kill().await;
            }
        }
    }

    fn build_args(&self, cache: &str, aio: &str, version: (u32, u32, u32)) -> Result<Vec<String>> {
        let cfg = &self.config;
        let mut args = vec![
            format!("--export-name={}", cfg.export_name),
            "--persistent".to_string(),
            format!("--shared={}", cfg.shared),
        ];

        match &self.sock {
            Address::Unix(path) => args.push(format!("--socket={}", path.display())),
            Address::Tcp { host, port } => {
                args.push(format!("--bind={host}"));
                args.push(format!("--port={port}"));
            }
        }

        if cfg.read_only {
            args.push("--read-only".to_string());
        }

        args.push(format!("--cache={cache}"));
        args.push(format!("--aio={aio}"));
        args.push(format!("--discard={}", cfg.discard));
        args.push(format!("--detect-zeroes={}", cfg.detect_zeroes));

        if let Some(bitmap) = &cfg.bitmap {
            args.push(format!("--bitmap={bitmap}"));
        }

        if version >= (5, 2, 0) {
            // Allocation depth on raw images is pointless, raw images
            // always report a single depth extent.
            if self.fmt != "raw" {
                args.push("--allocation-depth".to_string());
            }
        } else if self.fmt == "qcow2" && !cfg.backing_chain {
            return Err(Error::Qemu(
                "disabling the backing chain requires qemu-nbd >= 5.2.0".into(),
            ));
        }

        args.push(format!("json:{}", self.image_json()));
        Ok(args)
    }

    /// Build the json:{...} filename controlling all aspects of the
    /// image: driver, optional raw range, and backing chain override.
    fn image_json(&self) -> Value {
        let cfg = &self.config;
        let driver = if self.is_block_device() {
            "host_device"
        } else {
            "file"
        };
        let file = json!({"driver": driver, "filename": self.image});

        if cfg.offset.is_some() || cfg.size.is_some() {
            // Exposing a range in a raw file.
            let mut image = json!({"driver": "raw", "file": file});
            if let Some(offset) = cfg.offset {
                image["offset"] = offset.into();
            }
            if let Some(size) = cfg.size {
                image["size"] = size.into();
            }
            // A qcow2 driver on top of the raw range cannot have a
            // backing file, so backing_chain is ignored.
            if self.fmt == "qcow2" {
                image = json!({"driver": "qcow2", "file": image});
            }
            image
        } else {
            let mut image = json!({"driver": self.fmt, "file": file});
            if self.fmt == "qcow2" && !cfg.backing_chain {
                image["backing"] = Value::Null;
            }
            image
        }
    }

    fn can_use_direct_io(&self) -> bool {
        use std::os::unix::fs::OpenOptionsExt;
        let mut options = std::fs::OpenOptions::new();
        options.read(true).custom_flags(libc::O_DIRECT);
        if !self.config.read_only {
            options.write(true);
        }
        options.open(&self.image).is_ok()
    }

    fn is_block_device(&self) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(&self.image)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    async fn wait_for_socket(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        while tokio::time::Instant::now() < deadline {
            let connected = match &self.sock {
                Address::Unix(path) => UnixStream::connect(path).await.is_ok(),
                Address::Tcp { host, port } => {
                    TcpStream::connect((host.as_str(), *port)).await.is_ok()
                }
            };
            if connected {
                return true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        false
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // kill_on_drop on the child reaps a server that was not stopped
        // explicitly.
        if self.child.is_some() {
            warn!("qemu-nbd server dropped without stop()");
        }
    }
}

/// The qemu-nbd version as (major, minor, patch).
pub async fn version() -> Result<(u32, u32, u32)> {
    let output = Command::new(qemu_nbd_binary())
        .arg("--version")
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::Qemu("qemu-nbd --version failed".into()));
    }
    parse_version(&String::from_utf8_lossy(&output.stdout))
}

/// Parse the first line of qemu-nbd --version output, typically
/// "qemu-nbd 5.1.0 (qemu-kvm-5.1.0-20.el8)".
fn parse_version(out: &str) -> Result<(u32, u32, u32)> {
    let version_string = out
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or_else(|| Error::Qemu(format!("cannot parse qemu-nbd version: {out:?}")))?;

    let mut parts = version_string.split('.').map(str::parse);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch))) => Ok((major, minor, patch)),
        _ => Err(Error::Qemu(format!(
            "cannot parse qemu-nbd version: {version_string:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        let out = "qemu-nbd 5.1.0 (qemu-kvm-5.1.0-20.el8)\nmore text\n";
        assert_eq!(parse_version(out).unwrap(), (5, 1, 0));
        assert!(parse_version("garbage").is_err());
    }

    #[test]
    fn test_image_json_plain_raw() {
        let server = Server::new("/images/disk.raw", "raw", Address::unix("/tmp/nbd.sock"));
        assert_eq!(
            server.image_json(),
            json!({
                "driver": "raw",
                "file": {"driver": "file", "filename": "/images/disk.raw"},
            })
        );
    }

    #[test]
    fn test_image_json_qcow2_no_backing() {
        let config = ServerConfig {
            backing_chain: false,
            ..ServerConfig::default()
        };
        let server = Server::with_config(
            "/images/disk.qcow2",
            "qcow2",
            Address::unix("/tmp/nbd.sock"),
            config,
        );
        assert_eq!(
            server.image_json(),
            json!({
                "driver": "qcow2",
                "file": {"driver": "file", "filename": "/images/disk.qcow2"},
                "backing": null,
            })
        );
    }

    #[test]
    fn test_image_json_raw_range() {
        let config = ServerConfig {
            offset: Some(4096),
            size: Some(65536),
            ..ServerConfig::default()
        };
        let server = Server::with_config(
            "/images/disk.raw",
            "raw",
            Address::unix("/tmp/nbd.sock"),
            config,
        );
        assert_eq!(
            server.image_json(),
            json!({
                "driver": "raw",
                "file": {"driver": "file", "filename": "/images/disk.raw"},
                "offset": 4096,
                "size": 65536,
            })
        );
    }

    #[test]
    fn test_build_args_unix() {
        let server = Server::new("/images/disk.raw", "raw", Address::unix("/tmp/nbd.sock"));
        let args = server.build_args("none", "native", (6, 0, 0)).unwrap();
        assert!(args.contains(&"--persistent".to_string()));
        assert!(args.contains(&"--shared=8".to_string()));
        assert!(args.contains(&"--socket=/tmp/nbd.sock".to_string()));
        assert!(args.contains(&"--cache=none".to_string()));
        assert!(args.contains(&"--aio=native".to_string()));
        // Raw images do not get --allocation-depth.
        assert!(!args.contains(&"--allocation-depth".to_string()));
    }

    #[test]
    fn test_build_args_qcow2_allocation_depth() {
        let server = Server::new("/images/disk.qcow2", "qcow2", Address::tcp("::", 10809));
        let args = server.build_args("none", "native", (5, 2, 0)).unwrap();
        assert!(args.contains(&"--allocation-depth".to_string()));
        assert!(args.contains(&"--bind=::".to_string()));
        assert!(args.contains(&"--port=10809".to_string()));
    }

    #[test]
    fn test_build_args_old_qemu_backing_chain() {
        let config = ServerConfig {
            backing_chain: false,
            ..ServerConfig::default()
        };
        let server = Server::with_config(
            "/images/disk.qcow2",
            "qcow2",
            Address::unix("/tmp/nbd.sock"),
            config,
        );
        assert!(server.build_args("none", "native", (4, 2, 0)).is_err());
    }
}
