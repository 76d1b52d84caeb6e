use anyhow::{anyhow, bail, Context};
use serde_derive::{Deserialize, Serialize};

/// Client for the Shelly EM (Gen1) `/status` endpoint
#[derive(Clone)]
pub struct ShellyEmApi {
    status_url: String,
    username: String,
    password: String,
    channel: usize,
    client: reqwest::Client,
}

impl ShellyEmApi {
    pub fn new(host: &str, username: &str, password: &str, channel: usize) -> Self {
        let host = host.trim_end_matches('/');
        let status_url = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}/status")
        } else {
            format!("http://{host}/status")
        };
        Self {
            status_url,
            username: username.to_string(),
            password: password.to_string(),
            channel,
            client: reqwest::Client::new(),
        }
    }

    pub fn status_url(&self) -> &str {
        &self.status_url
    }

    pub async fn fetch_status(&self) -> Result<ShellyStatus, anyhow::Error> {
        let mut request = self.client.get(&self.status_url);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        let status = request
            .send()
            .await
            .with_context(|| format!("No response from Shelly EM - {}", self.status_url))?
            .error_for_status()?
            .json()
            .await
            .context("Converting response to JSON failed")?;
        Ok(status)
    }

    /// The meter's MAC address, published as the device serial
    pub async fn fetch_serial(&self) -> Result<String, anyhow::Error> {
        let status = self.fetch_status().await?;
        if status.mac.is_empty() {
            bail!("Response does not contain 'mac' attribute");
        }
        Ok(status.mac)
    }

    /// Picks the configured CT channel out of a status response
    pub fn channel_reading<'a>(
        &self,
        status: &'a ShellyStatus,
    ) -> Result<&'a EmeterReading, anyhow::Error> {
        status.emeters.get(self.channel).ok_or_else(|| {
            anyhow!(
                "Response has {} emeters, channel {} is missing",
                status.emeters.len(),
                self.channel
            )
        })
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellyStatus {
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub emeters: Vec<EmeterReading>,
}

/// One CT channel as reported by the Shelly EM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmeterReading {
    /// Instantaneous active power in W
    pub power: f64,
    #[serde(default)]
    pub reactive: f64,
    pub voltage: f64,
    #[serde(default = "default_is_valid")]
    pub is_valid: bool,
    /// Imported energy in Wh
    pub total: f64,
    /// Exported energy in Wh
    pub total_returned: f64,
}

fn default_is_valid() -> bool {
    true
}
