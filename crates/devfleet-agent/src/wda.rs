//! Process-backed WebDriverAgent endpoint.
//!
//! Starting the endpoint optionally launches WDA on the device and then a
//! port-forward proxy from the local public port to the device's WDA port.
//! Both are child processes killed on stop or drop.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devfleet_core::{DeviceId, DeviceIdentity, DeviceInfo};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::endpoint::{render_command, DeviceEndpoint, EndpointFactory, TemplateVars};
use crate::error::{AgentError, Result};

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEVICE_INFO_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates [`WdaEndpoint`]s sharing one HTTP client.
#[derive(Debug, Clone)]
pub struct WdaEndpointFactory {
    config: Arc<AgentConfig>,
    http: reqwest::Client,
}

impl WdaEndpointFactory {
    /// Create a new factory.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn new(config: Arc<AgentConfig>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(2))
            .build()
            .expect("Failed to create HTTP client");

        Self { config, http }
    }
}

impl EndpointFactory for WdaEndpointFactory {
    fn create(&self, udid: &DeviceId) -> Arc<dyn DeviceEndpoint> {
        Arc::new(WdaEndpoint::new(
            udid.clone(),
            Arc::clone(&self.config),
            self.http.clone(),
        ))
    }
}

/// WDA proxy for one device.
#[derive(Debug)]
pub struct WdaEndpoint {
    udid: DeviceId,
    config: Arc<AgentConfig>,
    http: reqwest::Client,
    running: Mutex<Option<Running>>,
}

#[derive(Debug)]
struct Running {
    port: u16,
    proxy: Child,
    launcher: Option<Child>,
}

impl WdaEndpoint {
    /// Create an endpoint for `udid`. Nothing is spawned until `start`.
    #[must_use]
    pub fn new(udid: DeviceId, config: Arc<AgentConfig>, http: reqwest::Client) -> Self {
        Self {
            udid,
            config,
            http,
            running: Mutex::new(None),
        }
    }

    fn spawn(&self, template: &str, port: u16, role: &str) -> Result<Option<Child>> {
        let vars = TemplateVars {
            udid: self.udid.as_str(),
            port,
            device_port: self.config.device_wda_port,
            bundle: &self.config.wda_bundle_pattern,
        };
        let Some((program, args)) = render_command(template, &vars) else {
            return Ok(None);
        };

        debug!(udid = %self.udid, role, program = %program, ?args, "Spawning endpoint process");
        Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map(Some)
            .map_err(|e| AgentError::StartupFailed {
                udid: self.udid.clone(),
                reason: format!("{role} `{program}`: {e}"),
            })
    }

    async fn wait_for_port(&self, proxy: &mut Child, port: u16) -> Result<()> {
        let limit = self.config.startup_timeout();
        let deadline = Instant::now() + limit;

        loop {
            match proxy.try_wait() {
                Ok(Some(status)) => {
                    return Err(AgentError::StartupFailed {
                        udid: self.udid.clone(),
                        reason: format!("proxy exited with {status}"),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(AgentError::StartupFailed {
                        udid: self.udid.clone(),
                        reason: e.to_string(),
                    });
                }
            }

            if TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_ok() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(AgentError::StartupTimeout {
                    udid: self.udid.clone(),
                    timeout: limit,
                });
            }
            sleep(PORT_POLL_INTERVAL).await;
        }
    }

    async fn device_info(&self, key: &str) -> Option<String> {
        let (program, mut args) = render_command(
            &self.config.device_info_command,
            &TemplateVars {
                udid: self.udid.as_str(),
                port: 0,
                device_port: self.config.device_wda_port,
                bundle: &self.config.wda_bundle_pattern,
            },
        )?;
        args.extend(["-u", self.udid.as_str(), "-k", key].map(str::to_string));

        let output = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match timeout(DEVICE_INFO_TIMEOUT, output).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(_)) => return None,
            Ok(Err(e)) => {
                debug!(udid = %self.udid, key, error = %e, "Device info query failed");
                return None;
            }
            Err(_) => {
                warn!(udid = %self.udid, key, "Device info query timed out");
                return None;
            }
        };

        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!value.is_empty()).then_some(value)
    }
}

async fn shutdown(udid: &DeviceId, mut running: Running) {
    kill_child(udid, &mut running.proxy, "proxy").await;
    if let Some(mut launcher) = running.launcher.take() {
        kill_child(udid, &mut launcher, "launcher").await;
    }
    info!(udid = %udid, port = running.port, "Endpoint stopped");
}

async fn kill_child(udid: &DeviceId, child: &mut Child, role: &str) {
    if let Err(e) = child.kill().await {
        debug!(udid = %udid, role, error = %e, "Process already gone");
    }
}

#[async_trait]
impl DeviceEndpoint for WdaEndpoint {
    async fn identity(&self) -> DeviceIdentity {
        let name = self
            .device_info("DeviceName")
            .await
            .unwrap_or_else(|| self.udid.to_string());
        let product = self.device_info("ProductType").await.unwrap_or_default();

        DeviceIdentity { name, product }
    }

    async fn start(&self, port: u16) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            shutdown(&self.udid, previous).await;
        }

        let mut launcher = match &self.config.wda_launch_command {
            Some(template) => self.spawn(template, port, "launcher")?,
            None => None,
        };
        let Some(mut proxy) = self.spawn(&self.config.proxy_command, port, "proxy")? else {
            return Err(AgentError::StartupFailed {
                udid: self.udid.clone(),
                reason: "proxy command is empty".to_string(),
            });
        };

        if let Err(e) = self.wait_for_port(&mut proxy, port).await {
            kill_child(&self.udid, &mut proxy, "proxy").await;
            if let Some(launcher) = launcher.as_mut() {
                kill_child(&self.udid, launcher, "launcher").await;
            }
            return Err(e);
        }

        info!(udid = %self.udid, port, "Endpoint accepting connections");
        *running = Some(Running {
            port,
            proxy,
            launcher,
        });
        Ok(())
    }

    async fn stop(&self) {
        let previous = self.running.lock().await.take();
        if let Some(previous) = previous {
            shutdown(&self.udid, previous).await;
        }
    }

    async fn healthcheck(&self) -> Result<DeviceInfo> {
        let port = self.running.lock().await.as_ref().map(|r| r.port);
        let Some(port) = port else {
            return Err(AgentError::HealthcheckFailed {
                udid: self.udid.clone(),
                reason: "endpoint not started".to_string(),
            });
        };

        let url = format!("http://{}:{port}/status", Ipv4Addr::LOCALHOST);
        poll_status(
            &self.http,
            &url,
            self.config.healthcheck_timeout(),
            self.config.healthcheck_interval(),
        )
        .await
        .map_err(|reason| AgentError::HealthcheckFailed {
            udid: self.udid.clone(),
            reason,
        })
    }
}

/// GET `url` every `interval` until it returns a status payload or
/// `budget` runs out. On failure returns the last probe error.
pub async fn poll_status(
    http: &reqwest::Client,
    url: &str,
    budget: Duration,
    interval: Duration,
) -> std::result::Result<DeviceInfo, String> {
    let deadline = Instant::now() + budget;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let failure = match probe(http, url).await {
            Ok(info) => return Ok(info),
            Err(reason) => reason,
        };
        debug!(url, attempt, error = %failure, "Status probe failed");

        if Instant::now() + interval > deadline {
            return Err(failure);
        }
        sleep(interval).await;
    }
}

async fn probe(http: &reqwest::Client, url: &str) -> std::result::Result<DeviceInfo, String> {
    let response = http.get(url).send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("status {}", response.status()));
    }
    let body: Value = response.json().await.map_err(|e| e.to_string())?;
    DeviceInfo::from_status_payload(&body).map_err(|e| e.to_string())
}
