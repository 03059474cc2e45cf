use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use indoc::indoc;
use labflash_lib::config::{DeviceConfig, JobRequest};
use labflash_lib::{image, imageserver};
use tokio::io::AsyncReadExt;

/// Deterministic, poorly compressible content of `len` bytes.
fn pseudo_random(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

#[context("Generating test image")]
fn generate_image(dir: &Utf8Path, data: &[u8]) -> Result<Utf8PathBuf> {
    let raw = dir.join(image::IMAGE_FILE);
    std::fs::File::create(&raw)?.write_all(data)?;
    image::compress_file(&raw)
}

#[tokio::test]
async fn test_image_round_trip() -> Result<()> {
    let td = tempfile::tempdir()?;
    let dir = Utf8Path::from_path(td.path()).unwrap();
    // Spans several server chunks
    let data = pseudo_random(imageserver::CHUNK_SIZE * 2 + 12345);
    let gz = generate_image(dir, &data)?;
    assert!(!dir.join(image::IMAGE_FILE).exists());

    let session = imageserver::serve(&gz).await?;
    let mut client = tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, session.port())).await?;
    let mut compressed = Vec::new();
    client.read_to_end(&mut compressed).await?;
    let sent = session.finish(Duration::from_secs(30)).await?;
    assert_eq!(sent, compressed.len() as u64);
    assert_eq!(sent, std::fs::metadata(&gz)?.len());

    let mut received = Vec::new();
    flate2::read::GzDecoder::new(compressed.as_slice()).read_to_end(&mut received)?;
    assert_eq!(received.len(), data.len());
    assert!(received == data, "decompressed image differs");
    Ok(())
}

#[test]
fn test_load_files() -> Result<()> {
    let td = tempfile::tempdir()?;
    let dir = Utf8Path::from_path(td.path()).unwrap();
    let config = dir.join("dragonboard.yaml");
    std::fs::write(
        &config,
        indoc! {"
            agent_name: dragonboard-2
            device_ip: 10.101.49.12
            control_user: linaro
            test_device: /dev/mmcblk1
            reboot_script: [pdu-ctl --outlet 2 cycle]
        "},
    )?;
    let c = DeviceConfig::load(&config)?;
    assert_eq!(c.control_user, "linaro");
    assert_eq!(c.test_device().unwrap(), "/dev/mmcblk1");

    let job = dir.join("job.json");
    std::fs::write(&job, r#"{"provision_data": {"url": "http://images/core20.img.xz"}}"#)?;
    let j = JobRequest::load(&job)?;
    assert_eq!(j.credentials()?.username, "ubuntu");

    let e = DeviceConfig::load(&dir.join("absent.yaml")).unwrap_err();
    assert!(format!("{e:#}").contains("absent.yaml"));
    Ok(())
}
