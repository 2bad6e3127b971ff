//! qemu-img helpers
//!
//! Thin wrappers around the qemu-img binary, used to probe image
//! format, measure required space, and prepare test images.

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use crate::error::{Error, Result};

fn qemu_img_binary() -> String {
    std::env::var("QEMU_IMG").unwrap_or_else(|_| "qemu-img".to_string())
}

/// Output of `qemu-img info --output json`.
#[derive(Clone, Debug, Deserialize)]
pub struct ImageInfo {
    pub format: String,
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    #[serde(rename = "actual-size", default)]
    pub actual_size: u64,
    #[serde(rename = "backing-filename", default)]
    pub backing_filename: Option<String>,
}

/// Output of `qemu-img measure --output json`.
#[derive(Clone, Debug, Deserialize)]
pub struct Measure {
    pub required: u64,
    #[serde(rename = "fully-allocated")]
    pub fully_allocated: u64,
}

/// Probe an image, returning format and sizes.
pub async fn info(path: impl AsRef<Path>) -> Result<ImageInfo> {
    let out = run(&[
        "info",
        "--output",
        "json",
        &path.as_ref().to_string_lossy(),
    ])
    .await?;
    parse_json(&out)
}

/// Measure the space required to convert an image to `out_fmt`.
pub async fn measure(path: impl AsRef<Path>, out_fmt: &str) -> Result<Measure> {
    let out = run(&[
        "measure",
        "--output",
        "json",
        "-O",
        out_fmt,
        &path.as_ref().to_string_lossy(),
    ])
    .await?;
    parse_json(&out)
}

/// Create an image, optionally with a backing file.
pub async fn create(
    path: impl AsRef<Path>,
    fmt: &str,
    size: Option<u64>,
    backing: Option<(&str, &str)>,
) -> Result<()> {
    let mut args = vec!["create".to_string(), "-f".to_string(), fmt.to_string()];
    if let Some((backing_file, backing_fmt)) = backing {
        args.push("-b".to_string());
        args.push(backing_file.to_string());
        args.push("-F".to_string());
        args.push(backing_fmt.to_string());
    }
    args.push(path.as_ref().to_string_lossy().into_owned());
    if let Some(size) = size {
        args.push(size.to_string());
    }

    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    run(&args).await?;
    Ok(())
}

/// Add a persistent dirty bitmap to a qcow2 image.
pub async fn bitmap_add(path: impl AsRef<Path>, bitmap: &str) -> Result<()> {
    run(&[
        "bitmap",
        "--add",
        &path.as_ref().to_string_lossy(),
        bitmap,
    ])
    .await?;
    Ok(())
}

async fn run(args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new(qemu_img_binary())
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::Qemu(format!(
            "qemu-img {} failed rc={:?}: {}",
            args.first().unwrap_or(&""),
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(output.stdout)
}

fn parse_json<T: serde::de::DeserializeOwned>(out: &[u8]) -> Result<T> {
    serde_json::from_slice(out)
        .map_err(|err| Error::Qemu(format!("cannot parse qemu-img output: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info() {
        let out = br#"{
            "virtual-size": 1073741824,
            "filename": "disk.qcow2",
            "cluster-size": 65536,
            "format": "qcow2",
            "actual-size": 200704,
            "dirty-flag": false
        }"#;
        let info: ImageInfo = parse_json(out).unwrap();
        assert_eq!(info.format, "qcow2");
        assert_eq!(info.virtual_size, 1 << 30);
        assert_eq!(info.actual_size, 200_704);
        assert_eq!(info.backing_filename, None);
    }

    #[test]
    fn test_parse_measure() {
        let out = br#"{"required": 393216, "fully-allocated": 1074135040}"#;
        let measure: Measure = parse_json(out).unwrap();
        assert_eq!(measure.required, 393_216);
        assert_eq!(measure.fully_allocated, 1_074_135_040);
    }
}
