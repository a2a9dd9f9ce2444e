//! Deploy Orchestrator
//!
//! Drives one deployment over a fresh socket:
//!
//! 1. token from the [`TokenProvider`]
//! 2. connect, join `deploy:<app_id>`
//! 3. `manifest` → the paths the server still needs
//! 4. one `upload` task per needed path, all awaited
//! 5. `deploy`, then `install` when requested
//!
//! Each wait has its own timeout. Whatever happens after the socket is up,
//! the channel is left and the socket disconnected before returning.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::files::FileSource;
use super::manifest::{
    parse_reply, DeployReply, DeployResult, InstallResult, Manifest, ManifestEntry,
    ManifestReply,
};
use crate::auth::TokenProvider;
use crate::realtime::{Channel, Socket, SocketConfig};
use crate::types::{CourierError, Result};

pub const TOPIC_PREFIX: &str = "deploy:";

pub const MANIFEST_EVENT: &str = "manifest";
pub const UPLOAD_EVENT: &str = "upload";
pub const DEPLOY_EVENT: &str = "deploy";
pub const INSTALL_EVENT: &str = "install";

/// Topic for an application's deploy channel.
pub fn deploy_topic(app_id: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, app_id)
}

/// Per-phase timeouts and socket settings.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub socket: SocketConfig,
    pub join_timeout: Duration,
    pub manifest_timeout: Duration,
    /// Applies to each file separately
    pub upload_timeout: Duration,
    pub deploy_timeout: Duration,
    pub install_timeout: Duration,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            join_timeout: Duration::from_secs(10),
            manifest_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(60),
            deploy_timeout: Duration::from_secs(120),
            install_timeout: Duration::from_secs(120),
        }
    }
}

/// What to deploy, and where.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub endpoint: String,
    pub api_key: String,
    pub env: String,
    pub app_id: String,
    pub manifest: Manifest,
    pub install: bool,
}

pub struct Deployer {
    tokens: Arc<dyn TokenProvider>,
    files: Arc<dyn FileSource>,
    options: DeployOptions,
}

impl Deployer {
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        files: Arc<dyn FileSource>,
        options: DeployOptions,
    ) -> Self {
        Self {
            tokens,
            files,
            options,
        }
    }

    pub fn options(&self) -> &DeployOptions {
        &self.options
    }

    /// Run a deployment end to end.
    pub async fn deploy(&self, request: &DeployRequest) -> Result<DeployResult> {
        let token = self
            .tokens
            .token(&request.endpoint, &request.api_key, &request.env)
            .await?;

        let socket =
            Socket::connect(&request.endpoint, &token, self.options.socket.clone()).await?;
        let channel = socket.channel(&deploy_topic(&request.app_id));

        let result = self.run(&channel, request).await;

        if let Err(e) = channel.leave().await {
            debug!(error = %e, "Leave not sent");
        }
        socket.disconnect().await;

        match &result {
            Ok(done) => info!(
                app_id = %request.app_id,
                version = %done.version,
                file_count = done.file_count,
                uploaded = done.uploaded.len(),
                "Deploy complete"
            ),
            Err(e) => warn!(app_id = %request.app_id, error = %e, "Deploy failed"),
        }
        result
    }

    async fn run(&self, channel: &Arc<Channel>, request: &DeployRequest) -> Result<DeployResult> {
        channel.join(self.options.join_timeout).await?;

        let needed = self.negotiate(channel, &request.manifest).await?;
        let uploaded = self.upload_all(channel, &request.manifest, needed).await?;

        let response = channel
            .call(
                DEPLOY_EVENT,
                &json!({ "version": request.manifest.version }),
                self.options.deploy_timeout,
            )
            .await?;
        let deployed: DeployReply = parse_reply(DEPLOY_EVENT, response)?;
        info!(version = %deployed.version, file_count = deployed.file_count, "Deployed");

        let install = if request.install {
            Some(self.install(channel, &deployed.version).await?)
        } else {
            None
        };

        Ok(DeployResult {
            version: deployed.version,
            file_count: deployed.file_count,
            uploaded,
            install,
        })
    }

    async fn negotiate(&self, channel: &Channel, manifest: &Manifest) -> Result<Vec<String>> {
        debug!(
            version = %manifest.version,
            files = manifest.files.len(),
            bytes = manifest.total_size(),
            "Sending manifest"
        );

        let response = channel
            .call(
                MANIFEST_EVENT,
                &manifest.to_payload()?,
                self.options.manifest_timeout,
            )
            .await?;
        let reply: ManifestReply = parse_reply(MANIFEST_EVENT, response)?;

        info!(
            needed = reply.need_files.len(),
            offered = manifest.files.len(),
            "Manifest accepted"
        );
        Ok(reply.need_files)
    }

    /// Upload every needed file concurrently and wait for all of them.
    ///
    /// Returns the first failure seen; the other uploads still run to
    /// completion.
    async fn upload_all(
        &self,
        channel: &Arc<Channel>,
        manifest: &Manifest,
        needed: Vec<String>,
    ) -> Result<Vec<String>> {
        let entries = needed
            .iter()
            .map(|path| {
                manifest.get(path).cloned().ok_or_else(|| {
                    CourierError::Protocol(format!(
                        "server requested {} which is not in the manifest",
                        path
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if entries.is_empty() {
            info!("Server already has every file");
            return Ok(Vec::new());
        }

        let mut tasks = JoinSet::new();
        for entry in entries {
            let channel = Arc::clone(channel);
            let files = Arc::clone(&self.files);
            let timeout = self.options.upload_timeout;
            tasks.spawn(async move {
                match upload_file(&channel, files.as_ref(), &entry, timeout).await {
                    Ok(()) => Ok(entry.path),
                    Err(e) => Err(CourierError::Upload {
                        path: entry.path,
                        source: Box::new(e),
                    }),
                }
            });
        }

        let mut uploaded = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(CourierError::Protocol(format!("upload task failed: {}", e)))
            });
            match outcome {
                Ok(path) => uploaded.push(path),
                Err(e) => {
                    warn!(error = %e, "Upload failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        uploaded.sort();
        Ok(uploaded)
    }

    async fn install(&self, channel: &Channel, version: &str) -> Result<InstallResult> {
        let response = channel
            .call(
                INSTALL_EVENT,
                &json!({ "version": version }),
                self.options.install_timeout,
            )
            .await?;
        let installed: InstallResult = parse_reply(INSTALL_EVENT, response)?;
        info!(success = installed.success, version = %installed.version, "Install finished");
        Ok(installed)
    }
}

async fn upload_file(
    channel: &Channel,
    files: &dyn FileSource,
    entry: &ManifestEntry,
    timeout: Duration,
) -> Result<()> {
    let content = files.read(&entry.path).await?;
    channel
        .call_binary_file(UPLOAD_EVENT, &entry.metadata(), &content, timeout)
        .await?;
    debug!(path = %entry.path, bytes = content.len(), "Uploaded");
    Ok(())
}
