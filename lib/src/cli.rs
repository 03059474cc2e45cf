//! # Agent command line interface
//!
//! Command line tool to provision and recover lab devices.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use tracing::Instrument;

use crate::config::{DeviceConfig, JobRequest};
use crate::error::ResultExt;
use crate::maas::{self, MaasNode};
use crate::provision::Provisioner;
use crate::remote::SshChannel;
use crate::task::HostRunner;
use crate::verify::BootVerifier;
use crate::Result;

/// Options naming the device configuration.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ConfigOpts {
    /// Path to the device configuration (YAML)
    #[clap(long, short = 'c')]
    pub(crate) config: Utf8PathBuf,
}

/// Perform a provisioning run
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ProvisionOpts {
    #[clap(flatten)]
    pub(crate) config: ConfigOpts,

    /// Path to the job description (JSON)
    #[clap(long, short = 'j')]
    pub(crate) job_data: Utf8PathBuf,

    /// Directory the image is downloaded into
    #[clap(long, default_value = ".")]
    pub(crate) workdir: Utf8PathBuf,
}

/// Operations on machines managed by MAAS
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum MaasOpts {
    /// Allocate and deploy the machine
    Provision {
        #[clap(flatten)]
        config: ConfigOpts,

        /// Path to the job description (JSON)
        #[clap(long, short = 'j')]
        job_data: Utf8PathBuf,
    },
    /// Release the machine back to the pool
    Release(ConfigOpts),
}

/// Provision lab devices with test images, and bring them back to their
/// control image.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "labflash")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) enum Opt {
    /// Flash the job's image onto the device and boot into it.
    ///
    /// The device is first brought back to its control image if needed.
    /// On failure the target disk is wiped so that the next power cycle
    /// boots the control image.
    Provision(ProvisionOpts),
    /// Make sure the device is running its control image.
    Recover(ConfigOpts),
    /// Devices deployed through MAAS.
    #[clap(subcommand)]
    Maas(MaasOpts),
}

fn load_config(path: &Utf8Path) -> Result<DeviceConfig> {
    // Without a usable config nobody can tell what state the device is in
    DeviceConfig::load(path).or_recovery()
}

fn load_job(path: &Utf8Path) -> Result<JobRequest> {
    JobRequest::load(path).or_provisioning()
}

fn agent_span(config: &DeviceConfig) -> tracing::Span {
    tracing::info_span!("agent", name = config.agent_name())
}

async fn provision(config: DeviceConfig, job: JobRequest, workdir: &Utf8Path) -> Result<()> {
    Provisioner::from_config(config, job).run(workdir).await
}

async fn recover(config: DeviceConfig) -> Result<()> {
    Provisioner::from_config(config, JobRequest::default())
        .ensure_control_image()
        .await
}

async fn maas_provision(config: DeviceConfig, job: JobRequest) -> Result<()> {
    let runner = HostRunner;
    let node = MaasNode::from_config(&runner, &config)?;
    let test = SshChannel::new(&job.test_data.test_username, &config.device_ip);
    let verifier = BootVerifier::new(&test, &test);
    node.provision(&verifier, job.distro(), maas::DEPLOY_BUDGET)
        .await
}

async fn maas_release(config: DeviceConfig) -> Result<()> {
    let runner = HostRunner;
    MaasNode::from_config(&runner, &config)?
        .release(maas::RELEASE_BUDGET)
        .await
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Provision(opts) => {
            let config = load_config(&opts.config.config)?;
            let job = load_job(&opts.job_data)?;
            let span = agent_span(&config);
            provision(config, job, &opts.workdir).instrument(span).await
        }
        Opt::Recover(opts) => {
            let config = load_config(&opts.config)?;
            let span = agent_span(&config);
            recover(config).instrument(span).await
        }
        Opt::Maas(MaasOpts::Provision { config, job_data }) => {
            let config = load_config(&config.config)?;
            let job = load_job(&job_data)?;
            let span = agent_span(&config);
            maas_provision(config, job).instrument(span).await
        }
        Opt::Maas(MaasOpts::Release(opts)) => {
            let config = load_config(&opts.config)?;
            let span = agent_span(&config);
            maas_release(config).instrument(span).await
        }
    }
}

#[test]
fn test_parse_opts() {
    let opt = Opt::try_parse_from([
        "labflash",
        "provision",
        "--config",
        "/etc/labflash/rpi3.yaml",
        "-j",
        "job.json",
    ])
    .unwrap();
    assert_eq!(
        opt,
        Opt::Provision(ProvisionOpts {
            config: ConfigOpts {
                config: "/etc/labflash/rpi3.yaml".into()
            },
            job_data: "job.json".into(),
            workdir: ".".into(),
        })
    );

    let opt = Opt::try_parse_from(["labflash", "maas", "release", "-c", "node.yaml"]).unwrap();
    assert_eq!(
        opt,
        Opt::Maas(MaasOpts::Release(ConfigOpts {
            config: "node.yaml".into()
        }))
    );

    // A provisioning run needs a job
    assert!(Opt::try_parse_from(["labflash", "provision", "-c", "rpi3.yaml"]).is_err());
}

#[tokio::test]
async fn test_config_errors_are_recovery() {
    let td = tempfile::tempdir().unwrap();
    let dir = Utf8Path::from_path(td.path()).unwrap();
    let e = run_from_iter(["labflash", "recover", "-c", dir.join("missing.yaml").as_str()])
        .await
        .unwrap_err();
    assert!(e.is_recovery());

    let config = dir.join("rpi3.yaml");
    std::fs::write(&config, "device_ip: 10.0.0.2\ntest_device: /dev/sda\n").unwrap();
    std::fs::write(dir.join("job.json"), "{not json").unwrap();
    let e = run_from_iter([
        "labflash",
        "provision",
        "-c",
        config.as_str(),
        "-j",
        dir.join("job.json").as_str(),
    ])
    .await
    .unwrap_err();
    assert!(!e.is_recovery());

    // A job without an image is rejected before the device is probed
    std::fs::write(dir.join("job.json"), r#"{"test_data": {}}"#).unwrap();
    let e = run_from_iter([
        "labflash",
        "provision",
        "-c",
        config.as_str(),
        "-j",
        dir.join("job.json").as_str(),
    ])
    .await
    .unwrap_err();
    assert!(!e.is_recovery());
    assert!(e.to_string().contains("Error provisioning system"));
}
