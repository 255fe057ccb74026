use crate::types::*;

pub const CLIENT_ASSET_PREFIX: &str = "newt";
pub const PRIMARY_ASSET_PREFIX: &str = "newtsvc";
pub const SECONDARY_ASSET_PREFIX: &str = "newtsvc-tray";

pub fn get_system_info() -> PlatformInfo {
    platform_for(std::env::consts::OS, std::env::consts::ARCH)
}

pub fn platform_for(os: &str, arch: &str) -> PlatformInfo {
    let normalized_os = match os {
        "macos" => "darwin",
        other => other,
    };

    let normalized_arch = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm32",
        // The client only ships amd64 builds for anything else
        _ => "amd64",
    };

    PlatformInfo {
        os: normalized_os.to_string(),
        arch: normalized_arch.to_string(),
    }
}

/// Release asset name of the Newt client binary, e.g. `newt_linux_amd64` or `newt_windows_arm64.exe`.
pub fn client_asset_name(platform: &PlatformInfo) -> String {
    format!(
        "{}_{}_{}{}",
        CLIENT_ASSET_PREFIX,
        platform.os,
        platform.arch,
        platform.exe_suffix()
    )
}

/// The pieces a supervisor release may ship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetRole {
    /// Native installer package for managed installs.
    Installer,
    /// The supervisor executable itself.
    Primary,
    /// Companion executable installed next to the primary one.
    Secondary,
}

impl AssetRole {
    pub fn expected_name(self, platform: &PlatformInfo) -> Option<String> {
        let prefix = match self {
            AssetRole::Installer => return None,
            AssetRole::Primary => PRIMARY_ASSET_PREFIX,
            AssetRole::Secondary => SECONDARY_ASSET_PREFIX,
        };
        Some(format!(
            "{}_{}_{}{}",
            prefix,
            platform.os,
            platform.arch,
            platform.exe_suffix()
        ))
    }

    /// Name the file takes once installed next to the running binary.
    pub fn installed_name(self, platform: &PlatformInfo) -> Option<String> {
        match self {
            AssetRole::Installer => None,
            AssetRole::Primary => Some(format!("{}{}", PRIMARY_ASSET_PREFIX, platform.exe_suffix())),
            AssetRole::Secondary => {
                Some(format!("{}{}", SECONDARY_ASSET_PREFIX, platform.exe_suffix()))
            }
        }
    }
}

pub fn installer_suffix(platform: &PlatformInfo) -> &'static str {
    match platform.os.as_str() {
        "windows" => ".msi",
        "darwin" => ".pkg",
        _ => ".deb",
    }
}

/// Picks the asset whose name equals `expected_name`, ignoring case.
///
/// Returns `None` when nothing matches and also when several assets match, so a
/// duplicated upload never resolves to an arbitrary candidate.
pub fn select_asset<'a>(assets: &'a [Asset], expected_name: &str) -> Option<&'a Asset> {
    if assets.is_empty() {
        tracing::warn!("No assets in release");
        return None;
    }

    tracing::debug!(
        "Available assets: {}",
        assets
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let matches: Vec<&Asset> = assets
        .iter()
        .filter(|asset| asset.name.eq_ignore_ascii_case(expected_name))
        .collect();

    unique(matches, expected_name)
}

pub fn select_role_asset<'a>(
    assets: &'a [Asset],
    role: AssetRole,
    platform: &PlatformInfo,
) -> Option<&'a Asset> {
    match role.expected_name(platform) {
        Some(name) => select_asset(assets, &name),
        None => {
            let suffix = installer_suffix(platform);
            let matches: Vec<&Asset> = assets
                .iter()
                .filter(|asset| {
                    let name = asset.name.to_lowercase();
                    name.len() > suffix.len() && name.ends_with(suffix)
                })
                .collect();
            unique(matches, &format!("*{}", suffix))
        }
    }
}

fn unique<'a>(matches: Vec<&'a Asset>, wanted: &str) -> Option<&'a Asset> {
    match matches.as_slice() {
        [] => {
            tracing::warn!("No asset matching '{}'", wanted);
            None
        }
        [asset] => {
            tracing::info!("Selected asset: {}", asset.name);
            Some(*asset)
        }
        many => {
            tracing::warn!(
                "Ambiguous asset match for '{}': {}",
                wanted,
                many.iter()
                    .map(|a| a.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            None
        }
    }
}
