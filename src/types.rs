use serde::{Deserialize, Serialize};

/// Connection settings handed to the Newt client plus the supervisor's own knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub settings: ServiceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSettings {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_auto_update_client")]
    pub auto_update_client: bool,
    #[serde(default = "default_update_check_hours")]
    pub update_check_hours: u64,
    #[serde(default)]
    pub include_prerelease: bool,
    #[serde(default)]
    pub auto_update_app: bool,
}

fn default_check_interval_secs() -> u64 {
    10
}
fn default_stop_timeout_secs() -> u64 {
    5
}
fn default_auto_update_client() -> bool {
    true
}
fn default_update_check_hours() -> u64 {
    24
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            auto_update_client: default_auto_update_client(),
            update_check_hours: default_update_check_hours(),
            include_prerelease: false,
            auto_update_app: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
}

impl PlatformInfo {
    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    pub fn exe_suffix(&self) -> &'static str {
        if self.is_windows() {
            ".exe"
        } else {
            ""
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}
