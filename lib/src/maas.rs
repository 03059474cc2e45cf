//! Devices managed by a MAAS region, driven through the `maas` CLI.
//!
//! These machines are deployed and released by the fleet service rather
//! than flashed through a control host.

use std::cell::RefCell;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::budget::RetryBudget;
use crate::config::DeviceConfig;
use crate::error::ResultExt;
use crate::remote::RemoteShell;
use crate::task::{Task, TaskRunner};
use crate::verify::BootVerifier;
use crate::{Error, Result};

/// Polling for a deployment: ten checks a minute apart.
pub const DEPLOY_BUDGET: RetryBudget = RetryBudget::counted(10, 60);
/// Polling for a release: ten checks five seconds apart.
pub const RELEASE_BUDGET: RetryBudget = RetryBudget::counted(10, 5);
const MAAS_TIMEOUT: Duration = Duration::from_secs(120);

const STATUS_DEPLOYED: &str = "Deployed";
const STATUS_READY: &str = "Ready";

#[derive(Debug, Deserialize)]
struct Machine {
    status_name: Option<String>,
}

/// One machine, as seen through a MAAS CLI profile.
#[derive(Debug)]
pub struct MaasNode<'a, L> {
    runner: &'a L,
    user: &'a str,
    node_id: &'a str,
    agent_name: &'a str,
}

impl<'a, L: TaskRunner> MaasNode<'a, L> {
    /// Look up the MAAS profile and machine id in `config`.
    pub fn from_config(runner: &'a L, config: &'a DeviceConfig) -> Result<Self> {
        let user = config
            .maas_user
            .as_deref()
            .ok_or_else(|| Error::recovery_msg("Device config missing maas_user"))?;
        let node_id = config
            .node_id
            .as_deref()
            .ok_or_else(|| Error::recovery_msg("Device config missing node_id"))?;
        Ok(Self {
            runner,
            user,
            node_id,
            agent_name: config.agent_name(),
        })
    }

    async fn maas(&self, args: &[&str]) -> anyhow::Result<String> {
        let mut argv = vec!["maas", self.user];
        argv.extend_from_slice(args);
        let task = Task::new(format!("maas {}", args.join(" ")), argv).timeout(MAAS_TIMEOUT);
        Ok(self.runner.run(&task).await?)
    }

    /// The machine's current status name, e.g. `Ready` or `Deployed`.
    pub async fn node_status(&self) -> anyhow::Result<Option<String>> {
        let out = self.maas(&["machine", "read", self.node_id]).await?;
        let m: Machine = serde_json::from_str(&out).context("Parsing machine status")?;
        Ok(m.status_name)
    }

    /// Poll until the status is `want` (and `extra` agrees), recording the
    /// last status seen. Status lookup failures count as not there yet.
    async fn wait_for_status<F, Fut>(
        &self,
        want: &str,
        budget: RetryBudget,
        extra: F,
    ) -> std::result::Result<(), Option<String>>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let last = &RefCell::new(None);
        let extra = &extra;
        let reached = budget
            .poll(move || async move {
                let status = match self.node_status().await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::debug!("{e:#}");
                        None
                    }
                };
                let matched = status.as_deref() == Some(want);
                *last.borrow_mut() = status;
                matched && extra().await
            })
            .await;
        if reached {
            Ok(())
        } else {
            Err(last.take())
        }
    }

    /// Acquire and deploy the machine with `distro`, then wait for the
    /// test image to answer.
    pub async fn provision<R: RemoteShell>(
        &self,
        verifier: &BootVerifier<'_, R>,
        distro: &str,
        budget: RetryBudget,
    ) -> Result<()> {
        tracing::info!("Acquiring node");
        let system_id = format!("system_id={}", self.node_id);
        self.maas(&["machines", "allocate", system_id.as_str()])
            .await
            .or_provisioning()?;
        tracing::info!("Starting node {} with distro {distro}", self.agent_name);
        let series = format!("distro_series={distro}");
        let output = self
            .maas(&["machine", "deploy", self.node_id, series.as_str()])
            .await
            .or_provisioning()?;

        let waited = self
            .wait_for_status(STATUS_DEPLOYED, budget, || verifier.is_test_booted())
            .await;
        if let Err(last) = waited {
            tracing::error!(
                "Device {} still in {:?} state, deployment failed",
                self.agent_name,
                last.unwrap_or_default()
            );
            tracing::error!("{}", output.trim());
            return Err(Error::provisioning_msg("Provisioning failed"));
        }
        Ok(())
    }

    /// Release the machine and wait for it to become available again.
    pub async fn release(&self, budget: RetryBudget) -> Result<()> {
        tracing::info!("Releasing node {}", self.agent_name);
        self.maas(&["machine", "release", self.node_id])
            .await
            .or_recovery()?;
        let waited = self
            .wait_for_status(STATUS_READY, budget, || async { true })
            .await;
        if let Err(last) = waited {
            tracing::error!(
                "Device {} still in {:?} state, could not recover",
                self.agent_name,
                last.unwrap_or_default()
            );
            return Err(Error::recovery_msg("Device recovery failed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use tokio::time::Instant;

    use super::*;
    use crate::fixture::{Fake, Reply};

    fn config() -> DeviceConfig {
        DeviceConfig::parse(indoc! {"
            agent_name: maas-node-3
            device_ip: 10.0.0.30
            maas_user: lab
            node_id: abc123
        "})
        .unwrap()
    }

    fn status(s: &str) -> Reply {
        Reply::Ok(format!(r#"{{"system_id": "abc123", "status_name": "{s}"}}"#))
    }

    #[test]
    fn test_missing_ids() {
        let fake = Fake::new();
        let runner = fake.runner();
        let config = DeviceConfig::parse("device_ip: 10.0.0.30\nmaas_user: lab\n").unwrap();
        let e = MaasNode::from_config(&runner, &config).unwrap_err();
        assert!(e.is_recovery());
    }

    #[tokio::test]
    async fn test_node_status() {
        let fake = Fake::new();
        fake.on("machine read", [status("Allocated")]);
        let runner = fake.runner();
        let config = config();
        let node = MaasNode::from_config(&runner, &config).unwrap();
        assert_eq!(node.node_status().await.unwrap().as_deref(), Some("Allocated"));
        assert_eq!(fake.calls(), ["local: maas lab machine read abc123"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision() {
        let fake = Fake::new();
        fake.on(
            "machine read",
            [status("Deploying"), status("Deployed"), status("Deployed")],
        );
        fake.on("snap -h", [Reply::Fail, Reply::ok("")]);
        let runner = fake.runner();
        let config = config();
        let test = fake.shell("ubuntu@10.0.0.30");
        let verifier = BootVerifier::new(&test, &test);
        let node = MaasNode::from_config(&runner, &config).unwrap();
        let start = Instant::now();
        node.provision(&verifier, "focal", DEPLOY_BUDGET).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(180));
        let calls = fake.calls();
        assert_eq!(calls[0], "local: maas lab machines allocate system_id=abc123");
        assert_eq!(calls[1], "local: maas lab machine deploy abc123 distro_series=focal");
        assert_eq!(fake.count("snap -h"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_fails() {
        let fake = Fake::new();
        fake.on("machine read", [status("Failed deployment")]);
        let runner = fake.runner();
        let config = config();
        let test = fake.shell("ubuntu@10.0.0.30");
        let verifier = BootVerifier::new(&test, &test);
        let node = MaasNode::from_config(&runner, &config).unwrap();
        let e = node
            .provision(&verifier, "xenial", DEPLOY_BUDGET)
            .await
            .unwrap_err();
        assert!(!e.is_recovery());
        assert_eq!(fake.count("machine read"), 10);
        assert_eq!(fake.count("snap -h"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_never_answers() {
        let fake = Fake::new();
        fake.on("machine read", [status("Deployed")]);
        fake.on("snap -h", [Reply::Fail]);
        let runner = fake.runner();
        let config = config();
        let test = fake.shell("ubuntu@10.0.0.30");
        let verifier = BootVerifier::new(&test, &test);
        let node = MaasNode::from_config(&runner, &config).unwrap();
        let e = node
            .provision(&verifier, "xenial", DEPLOY_BUDGET)
            .await
            .unwrap_err();
        assert_eq!(e.to_string(), "Provisioning failed: Provisioning failed");
        assert_eq!(fake.count("machine read"), 10);
        assert_eq!(fake.count("snap -h"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release() {
        let fake = Fake::new();
        fake.on("machine read", [Reply::Fail, status("Releasing"), status("Ready")]);
        let runner = fake.runner();
        let config = config();
        let node = MaasNode::from_config(&runner, &config).unwrap();
        let start = Instant::now();
        node.release(RELEASE_BUDGET).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(15));
        assert_eq!(fake.calls()[0], "local: maas lab machine release abc123");
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_times_out() {
        let fake = Fake::new();
        let releasing = r#"{"system_id": "abc123", "status_name": "Releasing"}"#;
        fake.on(
            "machine read",
            [Reply::Slow(Duration::from_secs(2), releasing.into())],
        );
        let runner = fake.runner();
        let config = config();
        let node = MaasNode::from_config(&runner, &config).unwrap();
        let start = Instant::now();
        let e = node.release(RELEASE_BUDGET).await.unwrap_err();
        assert!(e.is_recovery());
        // Slow status reads do not cost any of the ten polls
        assert_eq!(fake.count("machine read"), 10);
        assert_eq!(start.elapsed(), Duration::from_secs(70));
    }
}
