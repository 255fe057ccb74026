use crate::config::AppPaths;
use crate::download::Downloader;
use crate::platform::{client_asset_name, get_system_info, select_asset};
use crate::release::ReleaseSource;
use crate::types::*;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Installed client version, or `None` when the marker is missing or blank.
pub fn read_installed_version(version_file: &Path) -> Option<String> {
    let content = fs::read_to_string(version_file).ok()?;
    let version = content.trim();
    (!version.is_empty()).then(|| version.to_string())
}

/// Replaces the version marker in one step so readers never see a partial write.
pub fn write_installed_version(version_file: &Path, tag: &str) -> Result<()> {
    let dir = version_file
        .parent()
        .ok_or_else(|| anyhow!("Invalid version file path {}", version_file.display()))?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(tag.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(version_file)
        .map_err(|e| e.error)
        .with_context(|| format!("Could not write {}", version_file.display()))?;
    Ok(())
}

/// Downloads and installs the Newt client binary.
#[derive(Debug, Clone)]
pub struct ClientInstaller {
    source: ReleaseSource,
    downloader: Downloader,
    platform: PlatformInfo,
    paths: AppPaths,
}

impl ClientInstaller {
    pub fn new(source: ReleaseSource, downloader: Downloader, paths: AppPaths) -> Self {
        Self {
            source,
            downloader,
            platform: get_system_info(),
            paths,
        }
    }

    #[cfg(test)]
    pub fn with_platform(mut self, platform: PlatformInfo) -> Self {
        self.platform = platform;
        self
    }

    pub fn installed_version(&self) -> Option<String> {
        read_installed_version(&self.paths.version_file)
    }

    pub fn is_installed(&self) -> bool {
        self.paths.client_executable.is_file()
    }

    pub async fn latest_release(&self, include_prerelease: bool) -> Option<Release> {
        self.source.fetch_latest(include_prerelease).await
    }

    /// A release whose tag differs from the installed one, if any.
    ///
    /// Client tags are compared for equality rather than ordered, so moving the
    /// release channel back (e.g. leaving prereleases) also counts as an update.
    pub async fn check_for_update(&self, include_prerelease: bool) -> Option<Release> {
        let latest = self.latest_release(include_prerelease).await?;
        match self.installed_version() {
            Some(current) if current == latest.tag_name => {
                tracing::debug!("Newt {} is up to date", current);
                None
            }
            current => {
                tracing::info!(
                    "Newt update available: {} -> {}",
                    current.as_deref().unwrap_or("(none)"),
                    latest.tag_name
                );
                Some(latest)
            }
        }
    }

    /// Replaces the client binary with the asset from `release`, then records its tag.
    ///
    /// Callers stop the running client first on platforms that refuse to
    /// replace an executing image (Windows).
    pub async fn install<F>(&self, release: &Release, on_progress: F) -> Result<()>
    where
        F: FnMut(f64),
    {
        let expected = client_asset_name(&self.platform);
        let asset = select_asset(&release.assets, &expected).ok_or_else(|| {
            anyhow!(
                "No compatible asset '{}' in release {}",
                expected,
                release.tag_name
            )
        })?;

        fs::create_dir_all(&self.paths.data_dir)?;

        // The downloader renames a finished file onto the target, which unix
        // allows even while the old binary is executing
        tracing::info!("Installing {}...", release.tag_name);
        self.downloader
            .download(
                &asset.browser_download_url,
                &self.paths.client_executable,
                on_progress,
            )
            .await
            .with_context(|| {
                format!(
                    "Could not replace {}",
                    self.paths.client_executable.display()
                )
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.paths.client_executable)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&self.paths.client_executable, perms)?;
        }

        write_installed_version(&self.paths.version_file, &release.tag_name)?;

        tracing::info!("Updated to version {}", release.tag_name);
        Ok(())
    }

    /// Installs the latest release when the client binary is missing.
    ///
    /// A missing binary is the first-run case, not an error: failures are logged
    /// and the caller retries on its next cycle.
    pub async fn ensure_installed<F>(&self, include_prerelease: bool, on_progress: F) -> bool
    where
        F: FnMut(f64),
    {
        if self.is_installed() {
            tracing::info!("Newt found at {}", self.paths.client_executable.display());
            return true;
        }

        tracing::info!("Newt not found, downloading latest version...");
        let Some(release) = self.latest_release(include_prerelease).await else {
            tracing::error!("Failed to get latest release");
            return false;
        };

        match self.install(&release, on_progress).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Update failed: {:#}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::platform_for;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn release_server(tag: &str, binary: &[u8]) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "tag_name": tag,
                "name": tag,
                "prerelease": false,
                "assets": [
                    {
                        "name": "newt_linux_amd64",
                        "browser_download_url": format!("{}/download/newt_linux_amd64", server.uri()),
                        "size": binary.len()
                    },
                    {
                        "name": "newt_windows_amd64.exe",
                        "browser_download_url": format!("{}/download/newt_windows_amd64.exe", server.uri()),
                        "size": 1
                    }
                ]
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/download/newt_linux_amd64"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(binary.to_vec()))
            .mount(&server)
            .await;
        server
    }

    fn installer_for(server: &MockServer, paths: AppPaths) -> ClientInstaller {
        let client = reqwest::Client::new();
        ClientInstaller::new(
            ReleaseSource::with_client(client.clone(), format!("{}/releases", server.uri())),
            Downloader::new(client),
            paths,
        )
        .with_platform(platform_for("linux", "x86_64"))
    }

    #[test]
    fn version_marker_round_trips_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("version.txt");
        assert_eq!(read_installed_version(&file), None);

        write_installed_version(&file, "1.4.2").unwrap();
        assert_eq!(read_installed_version(&file).as_deref(), Some("1.4.2"));

        fs::write(&file, "  1.4.3\n").unwrap();
        assert_eq!(read_installed_version(&file).as_deref(), Some("1.4.3"));

        fs::write(&file, "\n").unwrap();
        assert_eq!(read_installed_version(&file), None);
    }

    #[tokio::test]
    async fn installs_missing_client_and_records_version() {
        let server = release_server("1.4.2", b"#!/bin/sh\necho newt\n").await;
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::with_dirs(dir.path().join("data"), dir.path().join("staging"));
        let installer = installer_for(&server, paths.clone());

        assert!(!installer.is_installed());
        assert!(installer.ensure_installed(false, |_| {}).await);

        assert_eq!(
            fs::read(&paths.client_executable).unwrap(),
            b"#!/bin/sh\necho newt\n"
        );
        assert_eq!(installer.installed_version().as_deref(), Some("1.4.2"));
        assert!(installer.check_for_update(false).await.is_none());
    }

    #[tokio::test]
    async fn overwrites_existing_binary_on_update() {
        let server = release_server("1.5.0", b"new build").await;
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::with_dirs(dir.path().join("data"), dir.path().join("staging"));
        fs::create_dir_all(&paths.data_dir).unwrap();
        fs::write(&paths.client_executable, b"old build").unwrap();
        write_installed_version(&paths.version_file, "1.4.2").unwrap();

        let installer = installer_for(&server, paths.clone());
        let release = installer.check_for_update(false).await.unwrap();
        assert_eq!(release.tag_name, "1.5.0");

        installer.install(&release, |_| {}).await.unwrap();
        assert_eq!(fs::read(&paths.client_executable).unwrap(), b"new build");
        assert_eq!(installer.installed_version().as_deref(), Some("1.5.0"));
    }

    #[tokio::test]
    async fn missing_platform_asset_is_an_error() {
        let server = release_server("1.5.0", b"unused").await;
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::with_dirs(dir.path().join("data"), dir.path().join("staging"));
        let installer =
            installer_for(&server, paths.clone()).with_platform(platform_for("macos", "aarch64"));

        let release = installer.latest_release(false).await.unwrap();
        assert!(installer.install(&release, |_| {}).await.is_err());
        assert!(!paths.client_executable.exists());
        assert_eq!(read_installed_version(&paths.version_file), None);
    }
}
