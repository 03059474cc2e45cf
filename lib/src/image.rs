//! Fetching and packing the job's image before it is served to the
//! control host.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::GzEncoder;
use flate2::Compression;
use fn_error_context::context;

/// File name the downloaded image is stored under.
pub const IMAGE_FILE: &str = "snappy.img";

/// Download `url` into `dest`, streaming the body to disk.
#[context("Downloading {url}")]
pub fn download(url: &str, dest: &Utf8Path) -> Result<()> {
    tracing::info!("Downloading file from {url}");
    let agent = ureq::Agent::new_with_defaults();
    let mut response = agent
        .get(url)
        .header("User-Agent", concat!("labflash/", env!("CARGO_PKG_VERSION")))
        .call()?;
    // Disk images are well beyond the default body limit
    let mut reader = response.body_mut().with_config().limit(u64::MAX).reader();
    let mut out = BufWriter::new(File::create(dest).with_context(|| format!("Creating {dest}"))?);
    let n = std::io::copy(&mut reader, &mut out)?;
    out.flush()?;
    tracing::debug!("Downloaded {n} bytes to {dest}");
    Ok(())
}

/// Gzip `path` next to itself as `<path>.gz`, then remove the original.
/// This is the format the control host decompresses with `gunzip -c`.
#[context("Compressing {path}")]
pub fn compress_file(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let dest = Utf8PathBuf::from(format!("{path}.gz"));
    let mut src = BufReader::new(File::open(path)?);
    let out = BufWriter::new(File::create(&dest).with_context(|| format!("Creating {dest}"))?);
    let mut enc = GzEncoder::new(out, Compression::fast());
    std::io::copy(&mut src, &mut enc)?;
    enc.finish()?.flush()?;
    std::fs::remove_file(path)?;
    Ok(dest)
}

/// Download the job's image into `workdir` and compress it, off the async
/// runtime. Returns the path of the compressed image.
pub async fn prepare(url: &str, workdir: &Utf8Path) -> Result<Utf8PathBuf> {
    let url = url.to_owned();
    let raw = workdir.join(IMAGE_FILE);
    tokio::task::spawn_blocking(move || {
        download(&url, &raw)?;
        compress_file(&raw)
    })
    .await?
}

/// The local address a peer at `host` should use to reach us: whichever
/// address the kernel would route toward it. No packets are sent.
#[context("Finding local address toward {host}")]
pub fn local_addr_toward(host: &str) -> Result<IpAddr> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    sock.connect((host, 9))?;
    Ok(sock.local_addr()?.ip())
}
