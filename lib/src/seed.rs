//! Seeding first-boot cloud-init data so the test account can log in.
//!
//! The payloads are built from typed structures and streamed to `sudo tee`
//! on the control host; nothing user-supplied is spliced into a command
//! line.
//!
//! cloud-init reads these files as YAML 1.1, where plain scalars such as
//! `yes`, `off` or `12:30` are not strings. The user-data document carries
//! the credentials, so it is emitted in JSON form, in which every string is
//! double-quoted.

use anyhow::{Context, Result};
use labflash_utils::{shell_join, shell_quote};
use serde::Serialize;

use crate::config::Credentials;
use crate::error::ResultExt;
use crate::inspect::{Detected, ImageFamily};
use crate::mount::{with_mount, MOUNT_POINT};
use crate::remote::{RemoteShell, DEFAULT_TIMEOUT};

const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";
const INSTANCE_ID: &str = "cloud-image";
const NOCLOUD_SEED_DIR: &str = "var/lib/cloud/seed/nocloud-net";
const CLOUD_CFG_DIR: &str = "etc/cloud/cloud.cfg.d";
const CORE20_CFG_DIR: &str = "data/etc/cloud/cloud.cfg.d";
const CORE20_CFG_FILE: &str = "99_nocloud.cfg";
// Shipped on classic images; it would shadow the NoCloud seed.
const FAKE_CLOUD_GLOB: &str = "99-fake?cloud.cfg";

#[derive(Debug, Serialize)]
struct UserData<'a> {
    password: &'a str,
    chpasswd: Chpasswd,
    ssh_pwauth: bool,
}

#[derive(Debug, Serialize)]
struct Chpasswd {
    list: Vec<String>,
    expire: bool,
}

#[derive(Debug, Serialize)]
struct MetaData {
    #[serde(rename = "instance-id")]
    instance_id: &'static str,
}

#[derive(Debug, Serialize)]
struct NoCloudConfig {
    datasource_list: [&'static str; 2],
    datasource: Datasource,
}

#[derive(Debug, Serialize)]
struct Datasource {
    #[serde(rename = "NoCloud")]
    nocloud: NoCloud,
}

#[derive(Debug, Serialize)]
struct NoCloud {
    #[serde(rename = "user-data")]
    user_data: String,
    #[serde(rename = "meta-data")]
    meta_data: String,
}

/// The `user-data` document enabling password login for `creds`.
///
/// JSON is valid YAML, and its quoted strings are never re-typed.
pub fn user_data(creds: &Credentials) -> Result<String> {
    let doc = UserData {
        password: &creds.password,
        chpasswd: Chpasswd {
            list: vec![format!("{}:{}", creds.username, creds.password)],
            expire: false,
        },
        ssh_pwauth: true,
    };
    let mut doc = serde_json::to_string_pretty(&doc)?;
    doc.push('\n');
    Ok(format!("{CLOUD_CONFIG_HEADER}{doc}"))
}

/// The `meta-data` document.
pub fn meta_data() -> Result<String> {
    Ok(serde_yaml::to_string(&MetaData {
        instance_id: INSTANCE_ID,
    })?)
}

/// A cloud.cfg.d fragment embedding a NoCloud datasource, for images that
/// have no seed directory.
pub fn nocloud_fragment(creds: &Credentials) -> Result<String> {
    let doc = NoCloudConfig {
        datasource_list: ["NoCloud", "None"],
        datasource: Datasource {
            nocloud: NoCloud {
                user_data: user_data(creds)?,
                meta_data: meta_data()?,
            },
        },
    };
    Ok(format!("{CLOUD_CONFIG_HEADER}{}", serde_yaml::to_string(&doc)?))
}

/// Files to write into a mounted image, and what to remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPlan {
    /// Directory created for the files
    pub directory: String,
    /// File names (relative to `directory`) and contents
    pub files: Vec<(String, String)>,
    /// Directory from which the fake-cloud fragment is removed
    pub remove_fake_cloud_from: Option<String>,
}

/// Work out the seed layout for `family`, relative to [`MOUNT_POINT`].
pub fn plan(family: ImageFamily, creds: &Credentials) -> Result<SeedPlan> {
    let base = match family {
        ImageFamily::Core => format!("{MOUNT_POINT}/system-data"),
        _ => MOUNT_POINT.to_owned(),
    };
    let plan = match family {
        ImageFamily::Core20 => SeedPlan {
            directory: format!("{base}/{CORE20_CFG_DIR}"),
            files: vec![(CORE20_CFG_FILE.into(), nocloud_fragment(creds)?)],
            remove_fake_cloud_from: None,
        },
        ImageFamily::LegacyClassic | ImageFamily::Core | ImageFamily::Unknown => SeedPlan {
            directory: format!("{base}/{NOCLOUD_SEED_DIR}"),
            files: vec![
                ("meta-data".into(), meta_data()?),
                ("user-data".into(), user_data(creds)?),
            ],
            remove_fake_cloud_from: (family == ImageFamily::LegacyClassic)
                .then(|| format!("{base}/{CLOUD_CFG_DIR}")),
        },
    };
    Ok(plan)
}

async fn write_plan<R: RemoteShell>(control: &R, plan: &SeedPlan) -> Result<()> {
    let mkdir = shell_join(["sudo", "mkdir", "-p", plan.directory.as_str()])?;
    control.run(&mkdir, DEFAULT_TIMEOUT).await?;
    for (name, contents) in &plan.files {
        let path = format!("{}/{name}", plan.directory);
        let tee = format!("sudo tee {} >/dev/null", shell_quote(&path)?);
        control
            .run_with_input(&tee, Some(contents.as_bytes()), DEFAULT_TIMEOUT)
            .await
            .with_context(|| format!("Writing {path}"))?;
    }
    if let Some(dir) = plan.remove_fake_cloud_from.as_deref() {
        // The glob is left for the remote shell to expand
        let rm = format!("sudo rm -f {}/{FAKE_CLOUD_GLOB}", shell_quote(dir)?);
        control.run(&rm, DEFAULT_TIMEOUT).await?;
    }
    Ok(())
}

/// Write first-boot login data into the detected partition.
pub async fn seed<R: RemoteShell>(
    control: &R,
    detected: &Detected,
    creds: &Credentials,
) -> crate::Result<()> {
    tracing::info!(
        "Creating user {} on {} ({})",
        creds.username,
        detected.partition,
        detected.family
    );
    let plan = plan(detected.family, creds)
        .context("Error creating user files")
        .or_provisioning()?;
    with_mount(control, &detected.partition, || write_plan(control, &plan))
        .await
        .context("Error creating user files")
        .or_provisioning()
}
