//! EC2 (AWS) datasource
//!
//! Fetches metadata from the EC2 Instance Metadata Service (IMDS).
//! Supports both IMDSv1 and IMDSv2 (preferred for security).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use super::Datasource;
use crate::InitError;

/// Registry name
pub const NAME: &str = "ec2";

/// EC2 metadata service base URL (link-local address)
const IMDS_BASE_URL: &str = "http://169.254.169.254";

/// IMDSv2 token TTL in seconds
const TOKEN_TTL_SECONDS: u32 = 21600;

/// EC2 datasource for AWS and compatible clouds
pub struct Ec2 {
    client: Client,
    base_url: String,
    /// Require EC2 DMI markers before touching the network
    check_dmi: bool,
    token: Option<String>,
    instance_id: String,
    hostname: Option<String>,
    availability_zone: Option<String>,
    local_mirror: String,
    public_keys: Vec<String>,
    user_data: Vec<u8>,
}

impl Ec2 {
    pub fn new() -> Self {
        let mut ec2 = Self::with_base_url(IMDS_BASE_URL);
        ec2.check_dmi = true;
        ec2
    }

    /// Talk to a metadata service at another address (useful for testing)
    pub fn with_base_url(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            check_dmi: false,
            token: None,
            instance_id: String::new(),
            hostname: None,
            availability_zone: None,
            local_mirror: super::DEFAULT_MIRROR.to_string(),
            public_keys: Vec::new(),
            user_data: Vec::new(),
        }
    }

    /// Availability zone reported by the metadata service
    pub fn availability_zone(&self) -> Option<&str> {
        self.availability_zone.as_deref()
    }

    /// Get IMDSv2 token for authenticated requests
    async fn get_imdsv2_token(&self) -> Option<String> {
        let url = format!("{}/latest/api/token", self.base_url);
        let response = self
            .client
            .put(&url)
            .header(
                "X-aws-ec2-metadata-token-ttl-seconds",
                TOKEN_TTL_SECONDS.to_string(),
            )
            .send()
            .await
            .ok()?;

        if response.status().is_success() {
            response.text().await.ok()
        } else {
            None
        }
    }

    /// GET a path below `/latest/`, with the IMDSv2 token when we have one
    async fn get(&self, path: &str) -> Result<reqwest::Response, InitError> {
        let url = format!("{}/latest/{}", self.base_url, path);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.header("X-aws-ec2-metadata-token", token);
        }
        Ok(request.send().await?)
    }

    /// Fetch a metadata path as text, `None` if the service has no value
    async fn fetch_metadata_path(&self, path: &str) -> Result<Option<String>, InitError> {
        let response = self.get(&format!("meta-data/{path}")).await?;

        match response.status() {
            status if status.is_success() => Ok(Some(response.text().await?.trim().to_string())),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(InitError::Datasource(format!(
                "Failed to fetch {path}: {status}"
            ))),
        }
    }

    /// Keys are listed as `<index>=<name>`, each served at
    /// `public-keys/<index>/openssh-key`
    async fn fetch_public_keys(&self) -> Result<Vec<String>, InitError> {
        let Some(listing) = self.fetch_metadata_path("public-keys/").await? else {
            return Ok(Vec::new());
        };

        let mut keys = Vec::new();
        for line in listing.lines() {
            let Some((index, _)) = line.split_once('=') else {
                continue;
            };
            let path = format!("public-keys/{}/openssh-key", index.trim());
            if let Some(key) = self.fetch_metadata_path(&path).await? {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn fetch_user_data(&self) -> Result<Vec<u8>, InitError> {
        let response = self.get("user-data").await?;

        // 404 means no user-data configured
        if response.status() == StatusCode::NOT_FOUND {
            debug!("No user-data available");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(InitError::Datasource(format!(
                "Failed to fetch user-data: {}",
                response.status()
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Check if we're running on EC2 by looking for DMI data
    async fn check_dmi_data() -> bool {
        let dmi_paths = [
            "/sys/class/dmi/id/product_name",
            "/sys/class/dmi/id/bios_vendor",
            "/sys/class/dmi/id/sys_vendor",
        ];

        for path in &dmi_paths {
            if let Ok(content) = tokio::fs::read_to_string(path).await {
                let content = content.to_lowercase();
                if content.contains("amazon") || content.contains("ec2") {
                    return true;
                }
            }
        }

        Path::new("/sys/hypervisor/uuid").exists()
    }
}

impl Default for Ec2 {
    fn default() -> Self {
        Self::new()
    }
}

/// Regional Ubuntu mirror for an availability zone such as `us-east-1a`
pub fn mirror_for_zone(zone: &str) -> Option<String> {
    let region = zone.strip_suffix(|c: char| c.is_ascii_alphabetic())?;
    if region.is_empty() {
        return None;
    }
    Some(format!("http://{region}.ec2.archive.ubuntu.com/ubuntu/"))
}

#[async_trait]
impl Datasource for Ec2 {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch(&mut self) -> Result<bool, InitError> {
        if self.check_dmi && !Self::check_dmi_data().await {
            debug!("No EC2 DMI markers found");
            return Ok(false);
        }

        self.token = self.get_imdsv2_token().await;
        if self.token.is_none() {
            debug!("IMDSv2 token unavailable, using IMDSv1");
        }

        // An unreachable service means this is not EC2
        let instance_id = match self.fetch_metadata_path("instance-id").await {
            Ok(Some(id)) => id,
            Ok(None) => return Ok(false),
            Err(InitError::Http(e)) => {
                debug!("Metadata service unreachable: {}", e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        self.hostname = self.fetch_metadata_path("local-hostname").await?;
        self.availability_zone = self
            .fetch_metadata_path("placement/availability-zone")
            .await?;
        if let Some(mirror) = self.availability_zone.as_deref().and_then(mirror_for_zone) {
            self.local_mirror = mirror;
        }

        self.public_keys = match self.fetch_public_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to fetch public keys: {}", e);
                Vec::new()
            }
        };
        self.user_data = self.fetch_user_data().await?;
        self.instance_id = instance_id;

        Ok(true)
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn raw_user_data(&self) -> &[u8] {
        &self.user_data
    }

    fn public_keys(&self) -> &[String] {
        &self.public_keys
    }

    fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    fn local_mirror(&self) -> &str {
        &self.local_mirror
    }
}
