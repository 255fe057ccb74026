//! Updating the supervisor's own binaries.
//!
//! A running executable cannot always replace itself, so a portable install
//! hands off to a staged copy of the new build:
//!
//! 1. the new binaries are downloaded into the staging directory,
//! 2. the staged primary is launched with `--apply-update <install dir> <pid>`,
//! 3. the current process exits,
//! 4. the staged process waits for that pid, swaps the files in (keeping
//!    `.old` copies) and launches the installed primary again.
//!
//! Managed installs skip all of this and run the platform installer package.

use crate::download::Downloader;
use crate::platform::{get_system_info, select_role_asset, AssetRole};
use crate::release::ReleaseSource;
use crate::types::*;
use crate::version::{is_newer, strip_v};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use thiserror::Error;

pub const APPLY_UPDATE_FLAG: &str = "--apply-update";
pub const FALLBACK_LOG_NAME: &str = "newtsvc-update-error.log";

/// Files whose presence marks an install owned by a package manager.
const MANAGED_MARKERS: &[&str] = &["unins000.exe", ".managed-install"];
/// Path fragments of system program directories, compared lowercase.
const SYSTEM_PROGRAM_DIRS: &[&str] = &["program files", "/usr/", "/opt/", "/applications/"];

const HANDOFF_WAIT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const SETTLE_DELAY: Duration = Duration::from_secs(1);

pub fn current_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("release {0} has no installer or executables for this platform")]
    NoAssets(String),
    #[error("nothing staged in {0}")]
    NothingStaged(PathBuf),
    #[error("could not launch {program}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    /// Installed by a package; updates go through the installer.
    Managed,
    /// Unpacked by hand; updates use the staged handoff.
    Portable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    InstallerLaunched,
    HandoffStarted,
}

/// A supervisor release resolved against one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRelease {
    pub tag_name: String,
    pub version: String,
    pub installer: Option<Asset>,
    pub primary: Option<Asset>,
    pub secondary: Option<Asset>,
}

impl AppRelease {
    pub fn from_release(release: &Release, platform: &PlatformInfo) -> Self {
        let pick = |role| select_role_asset(&release.assets, role, platform).cloned();
        Self {
            tag_name: release.tag_name.clone(),
            version: strip_v(&release.tag_name).to_string(),
            installer: pick(AssetRole::Installer),
            primary: pick(AssetRole::Primary),
            secondary: pick(AssetRole::Secondary),
        }
    }
}

/// The primitives the handoff relies on. Process-id waits are inherently racy,
/// so everything that touches another process goes through here.
pub trait ProcessHost: Send + Sync {
    /// `true` once `pid` is gone; `false` if it is still alive after `timeout`.
    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool;
    /// Pause long enough for the old process's file handles to be released.
    fn settle(&self);
    /// Starts `program` detached from the current process.
    fn launch(&self, program: &Path, args: &[OsString], cwd: &Path) -> std::io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl ProcessHost for SystemHost {
    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        loop {
            if !system.refresh_process(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn settle(&self) {
        std::thread::sleep(SETTLE_DELAY);
    }

    fn launch(&self, program: &Path, args: &[OsString], cwd: &Path) -> std::io::Result<()> {
        std::process::Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map(|_| ())
    }
}

pub fn detect_install_mode(install_dir: &Path) -> InstallMode {
    if MANAGED_MARKERS
        .iter()
        .any(|marker| install_dir.join(marker).exists())
    {
        return InstallMode::Managed;
    }

    let path = install_dir.to_string_lossy().replace('\\', "/").to_lowercase();
    let path = format!("{}/", path.trim_end_matches('/'));
    if SYSTEM_PROGRAM_DIRS.iter().any(|dir| path.contains(dir)) {
        InstallMode::Managed
    } else {
        InstallMode::Portable
    }
}

/// Installed file names swapped during a handoff, primary first.
pub fn managed_files(platform: &PlatformInfo) -> Vec<String> {
    [AssetRole::Primary, AssetRole::Secondary]
        .into_iter()
        .filter_map(|role| role.installed_name(platform))
        .collect()
}

pub struct SelfUpdater {
    source: ReleaseSource,
    downloader: Downloader,
    platform: PlatformInfo,
    install_dir: PathBuf,
    staging_dir: PathBuf,
    host: Arc<dyn ProcessHost>,
}

impl SelfUpdater {
    pub fn new(
        source: ReleaseSource,
        downloader: Downloader,
        install_dir: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            downloader,
            platform: get_system_info(),
            install_dir: install_dir.into(),
            staging_dir: staging_dir.into(),
            host: Arc::new(SystemHost),
        }
    }

    /// Updater for the binary that is currently running.
    pub fn for_current_exe(
        source: ReleaseSource,
        downloader: Downloader,
        staging_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(Self::new(source, downloader, current_install_dir()?, staging_dir))
    }

    #[cfg(test)]
    pub fn with_platform(mut self, platform: PlatformInfo) -> Self {
        self.platform = platform;
        self
    }

    #[cfg(test)]
    pub fn with_host(mut self, host: Arc<dyn ProcessHost>) -> Self {
        self.host = host;
        self
    }

    pub fn install_mode(&self) -> InstallMode {
        detect_install_mode(&self.install_dir)
    }

    /// A release newer than the running build, if one is published.
    pub async fn check(&self) -> Option<AppRelease> {
        let release = self.source.fetch_latest(false).await?;
        let app = AppRelease::from_release(&release, &self.platform);
        if is_newer(&app.version, current_version()) {
            tracing::info!("App update available: {} -> {}", current_version(), app.version);
            Some(app)
        } else {
            tracing::info!("App is up to date ({})", current_version());
            None
        }
    }

    /// Installs `release`. `request_exit` runs once a handoff has been started
    /// and must make the current process exit soon.
    pub async fn install<F, E>(
        &self,
        release: &AppRelease,
        mut on_progress: F,
        request_exit: E,
    ) -> Result<InstallOutcome>
    where
        F: FnMut(f64),
        E: FnOnce(),
    {
        let mode = self.install_mode();
        tracing::info!("Install mode: {:?}", mode);

        match (&release.installer, &release.primary) {
            (Some(installer), _) if mode == InstallMode::Managed => {
                self.run_installer(installer, &mut on_progress).await
            }
            (_, Some(primary)) => {
                self.stage_and_hand_off(release, primary, &mut on_progress)
                    .await?;
                request_exit();
                Ok(InstallOutcome::HandoffStarted)
            }
            (Some(installer), None) => {
                tracing::warn!("No executables in release {}, using installer", release.tag_name);
                self.run_installer(installer, &mut on_progress).await
            }
            (None, None) => Err(UpdateError::NoAssets(release.tag_name.clone()).into()),
        }
    }

    async fn run_installer<F>(&self, installer: &Asset, on_progress: &mut F) -> Result<InstallOutcome>
    where
        F: FnMut(f64),
    {
        // Startup cleanup clears the staging directory once the installer is done
        fs::create_dir_all(&self.staging_dir).with_context(|| {
            format!("Could not create staging directory {}", self.staging_dir.display())
        })?;
        let package = self.staging_dir.join(&installer.name);
        self.downloader
            .download(&installer.browser_download_url, &package, &mut *on_progress)
            .await?;

        let (program, args) = installer_command(&self.platform, &package);
        tracing::info!("Launching installer {}", package.display());
        self.host
            .launch(&program, &args, &self.staging_dir)
            .map_err(|source| UpdateError::Launch { program, source })?;
        Ok(InstallOutcome::InstallerLaunched)
    }

    async fn stage_and_hand_off<F>(
        &self,
        release: &AppRelease,
        primary: &Asset,
        on_progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(f64),
    {
        if self.staging_dir.exists() {
            fs::remove_dir_all(&self.staging_dir).with_context(|| {
                format!("Could not clear staging directory {}", self.staging_dir.display())
            })?;
        }
        fs::create_dir_all(&self.staging_dir)?;

        let staged = [
            (AssetRole::Primary, Some(primary)),
            (AssetRole::Secondary, release.secondary.as_ref()),
        ];
        let mut staged_primary = None;
        for (role, asset) in staged {
            let (Some(asset), Some(name)) = (asset, role.installed_name(&self.platform)) else {
                continue;
            };
            let dest = self.staging_dir.join(name);
            self.downloader
                .download(&asset.browser_download_url, &dest, &mut *on_progress)
                .await?;
            make_executable(&dest)?;
            if role == AssetRole::Primary {
                staged_primary = Some(dest);
            }
        }

        let staged_primary =
            staged_primary.ok_or_else(|| UpdateError::NothingStaged(self.staging_dir.clone()))?;
        let args = vec![
            OsString::from(APPLY_UPDATE_FLAG),
            self.install_dir.clone().into_os_string(),
            OsString::from(std::process::id().to_string()),
        ];
        tracing::info!(
            "Handing off to {} for {}",
            staged_primary.display(),
            release.tag_name
        );
        self.host
            .launch(&staged_primary, &args, &self.staging_dir)
            .map_err(|source| UpdateError::Launch {
                program: staged_primary.clone(),
                source,
            })?;
        Ok(())
    }
}

fn installer_command(platform: &PlatformInfo, package: &Path) -> (PathBuf, Vec<OsString>) {
    let package = package.as_os_str().to_os_string();
    match platform.os.as_str() {
        "windows" => (
            PathBuf::from("msiexec"),
            vec!["/i".into(), package, "/passive".into()],
        ),
        "darwin" => (PathBuf::from("open"), vec![package]),
        _ => (PathBuf::from("xdg-open"), vec![package]),
    }
}

fn current_install_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Could not locate the running executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("Executable {} has no parent directory", exe.display()))
}

fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn old_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".old");
    path.with_file_name(name)
}

/// Moves `dest` aside to `dest.old` and copies `staged` into its place.
fn replace_file(staged: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        let old = old_path(dest);
        if old.exists() {
            fs::remove_file(&old)
                .with_context(|| format!("Could not remove {}", old.display()))?;
        }
        fs::rename(dest, &old)
            .with_context(|| format!("Could not move {} aside", dest.display()))?;
    }
    fs::copy(staged, dest).with_context(|| format!("Could not install {}", dest.display()))?;
    make_executable(dest)
}

/// Second half of the handoff, run by the staged binary.
///
/// Returns the relaunched primary executable.
pub fn apply_update(
    install_dir: &Path,
    caller_pid: u32,
    staging_dir: &Path,
    files: &[String],
    host: &dyn ProcessHost,
) -> Result<PathBuf> {
    if !host.wait_for_exit(caller_pid, HANDOFF_WAIT) {
        tracing::warn!(
            "Process {} still running after {:?}, continuing",
            caller_pid,
            HANDOFF_WAIT
        );
    }
    host.settle();

    let mut placed = 0;
    for name in files {
        let staged = staging_dir.join(name);
        if !staged.is_file() {
            continue;
        }
        replace_file(&staged, &install_dir.join(name))?;
        tracing::info!("Installed {}", name);
        placed += 1;
    }
    if placed == 0 {
        bail!(UpdateError::NothingStaged(staging_dir.to_path_buf()));
    }

    let primary = files
        .first()
        .map(|name| install_dir.join(name))
        .ok_or_else(|| anyhow!("No primary executable to relaunch"))?;
    host.launch(&primary, &[], install_dir)
        .map_err(|source| UpdateError::Launch {
            program: primary.clone(),
            source,
        })?;
    Ok(primary)
}

/// Entry point for `--apply-update`. Errors go to the fallback log because
/// the regular logging setup may be the thing being replaced.
pub fn run_apply_mode(install_dir: &Path, caller_pid: u32) -> Result<()> {
    let result = current_install_dir().and_then(|staging_dir| {
        apply_update(
            install_dir,
            caller_pid,
            &staging_dir,
            &managed_files(&get_system_info()),
            &SystemHost,
        )
    });

    match result {
        Ok(primary) => {
            tracing::info!("Update applied, relaunched {}", primary.display());
            Ok(())
        }
        Err(e) => {
            write_fallback_log(&format!("Apply update failed: {:#}", e));
            Err(e)
        }
    }
}

pub fn fallback_log_path() -> PathBuf {
    std::env::temp_dir().join(FALLBACK_LOG_NAME)
}

pub fn write_fallback_log(message: &str) {
    append_fallback_log(&fallback_log_path(), message);
}

pub fn append_fallback_log(path: &Path, message: &str) {
    let line = format!("[{}] {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = file.write_all(line.as_bytes());
    }
}

/// Removes what a finished handoff leaves behind. Never fails.
///
/// Only the `.old` backups of `files` are touched; other `*.old` files next
/// to the executable belong to someone else.
pub fn cleanup_previous_update(install_dir: &Path, staging_dir: &Path, files: &[String]) -> usize {
    let mut removed = 0;

    for name in files {
        let path = old_path(&install_dir.join(name));
        if !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Removed {}", path.display());
                removed += 1;
            }
            Err(e) => tracing::debug!("Could not remove {}: {}", path.display(), e),
        }
    }

    if staging_dir.exists() {
        match fs::remove_dir_all(staging_dir) {
            Ok(()) => {
                tracing::debug!("Removed {}", staging_dir.display());
                removed += 1;
            }
            Err(e) => tracing::debug!("Could not remove {}: {}", staging_dir.display(), e),
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::platform_for;
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct FakeHost {
        exits: bool,
        waited: Mutex<Vec<u32>>,
        launched: Mutex<Vec<(PathBuf, Vec<OsString>)>>,
    }

    impl FakeHost {
        fn exiting() -> Self {
            Self {
                exits: true,
                ..Self::default()
            }
        }

        fn launched(&self) -> Vec<(PathBuf, Vec<OsString>)> {
            self.launched.lock().unwrap().clone()
        }
    }

    impl ProcessHost for FakeHost {
        fn wait_for_exit(&self, pid: u32, _timeout: Duration) -> bool {
            self.waited.lock().unwrap().push(pid);
            self.exits
        }

        fn settle(&self) {}

        fn launch(&self, program: &Path, args: &[OsString], _cwd: &Path) -> std::io::Result<()> {
            self.launched
                .lock()
                .unwrap()
                .push((program.to_path_buf(), args.to_vec()));
            Ok(())
        }
    }

    fn asset(name: &str, base: &str) -> Asset {
        Asset {
            name: name.to_string(),
            browser_download_url: format!("{}/{}", base, name),
            size: 1,
        }
    }

    fn linux() -> PlatformInfo {
        platform_for("linux", "x86_64")
    }

    fn files() -> Vec<String> {
        managed_files(&linux())
    }

    #[test]
    fn resolves_release_for_platform() {
        let release = Release {
            tag_name: "v0.4.0".to_string(),
            name: String::new(),
            prerelease: false,
            assets: vec![
                asset("newtsvc_0.4.0_amd64.deb", "https://example.invalid"),
                asset("newtsvc_linux_amd64", "https://example.invalid"),
                asset("newtsvc_windows_amd64.exe", "https://example.invalid"),
            ],
        };
        let app = AppRelease::from_release(&release, &linux());
        assert_eq!(app.version, "0.4.0");
        assert_eq!(app.installer.unwrap().name, "newtsvc_0.4.0_amd64.deb");
        assert_eq!(app.primary.unwrap().name, "newtsvc_linux_amd64");
        assert!(app.secondary.is_none());
    }

    #[test]
    fn detects_managed_installs() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_install_mode(dir.path()), InstallMode::Portable);

        fs::write(dir.path().join(".managed-install"), "").unwrap();
        assert_eq!(detect_install_mode(dir.path()), InstallMode::Managed);

        assert_eq!(
            detect_install_mode(Path::new(r"C:\Program Files\NewtService")),
            InstallMode::Managed
        );
        assert_eq!(detect_install_mode(Path::new("/opt/newtsvc")), InstallMode::Managed);
        assert_eq!(detect_install_mode(Path::new("/usr/bin")), InstallMode::Managed);
        assert_eq!(
            detect_install_mode(Path::new("/home/me/tools/newtsvc")),
            InstallMode::Portable
        );
    }

    #[test]
    fn apply_replaces_files_and_relaunches() {
        let install = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        fs::write(install.path().join("newtsvc"), "old primary").unwrap();
        fs::write(install.path().join("unrelated.txt"), "keep").unwrap();
        fs::write(staging.path().join("newtsvc"), "new primary").unwrap();
        fs::write(staging.path().join("newtsvc-tray"), "new tray").unwrap();

        let host = FakeHost::exiting();
        let relaunched =
            apply_update(install.path(), 4242, staging.path(), &files(), &host).unwrap();

        assert_eq!(relaunched, install.path().join("newtsvc"));
        assert_eq!(fs::read_to_string(install.path().join("newtsvc")).unwrap(), "new primary");
        assert_eq!(
            fs::read_to_string(install.path().join("newtsvc.old")).unwrap(),
            "old primary"
        );
        assert_eq!(
            fs::read_to_string(install.path().join("newtsvc-tray")).unwrap(),
            "new tray"
        );
        assert!(!install.path().join("newtsvc-tray.old").exists());
        assert_eq!(
            fs::read_to_string(install.path().join("unrelated.txt")).unwrap(),
            "keep"
        );

        assert_eq!(*host.waited.lock().unwrap(), vec![4242]);
        let launched = host.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].0, install.path().join("newtsvc"));
        assert!(launched[0].1.is_empty());
    }

    #[test]
    fn apply_proceeds_when_caller_outlives_the_wait() {
        let install = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        fs::write(install.path().join("newtsvc"), "current").unwrap();
        fs::write(install.path().join("newtsvc.old"), "stale").unwrap();
        fs::write(staging.path().join("newtsvc"), "next").unwrap();

        let host = FakeHost::default();
        apply_update(install.path(), 1, staging.path(), &files(), &host).unwrap();

        assert_eq!(fs::read_to_string(install.path().join("newtsvc")).unwrap(), "next");
        assert_eq!(
            fs::read_to_string(install.path().join("newtsvc.old")).unwrap(),
            "current"
        );
        assert_eq!(host.launched().len(), 1);
    }

    #[test]
    fn apply_without_staged_files_does_not_relaunch() {
        let install = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        fs::write(install.path().join("newtsvc"), "current").unwrap();

        let host = FakeHost::exiting();
        assert!(apply_update(install.path(), 1, staging.path(), &files(), &host).is_err());
        assert!(host.launched().is_empty());
        assert_eq!(fs::read_to_string(install.path().join("newtsvc")).unwrap(), "current");
    }

    #[test]
    fn cleanup_removes_old_files_and_staging() {
        let install = tempfile::tempdir().unwrap();
        let staging_root = tempfile::tempdir().unwrap();
        let staging = staging_root.path().join("newtsvc-update");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("newtsvc"), "staged").unwrap();
        fs::write(install.path().join("newtsvc.old"), "old").unwrap();
        fs::write(install.path().join("newtsvc-tray.old"), "old").unwrap();
        fs::write(install.path().join("newtsvc"), "current").unwrap();
        fs::write(install.path().join("notes.old"), "user data").unwrap();

        assert_eq!(cleanup_previous_update(install.path(), &staging, &files()), 3);
        assert!(!staging.exists());
        assert!(!install.path().join("newtsvc.old").exists());
        assert!(!install.path().join("newtsvc-tray.old").exists());
        assert!(install.path().join("newtsvc").exists());
        assert_eq!(
            fs::read_to_string(install.path().join("notes.old")).unwrap(),
            "user data"
        );

        // Nothing left to do, and missing directories are fine
        assert_eq!(cleanup_previous_update(install.path(), &staging, &files()), 0);
        assert_eq!(
            cleanup_previous_update(&install.path().join("missing"), &staging, &files()),
            0
        );
    }

    #[test]
    fn fallback_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(FALLBACK_LOG_NAME);
        append_fallback_log(&log, "first failure");
        append_fallback_log(&log, "second failure");

        let content = fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first failure"));
        assert!(lines[1].ends_with("second failure"));
    }

    async fn app_server(tag: &str) -> MockServer {
        let server = MockServer::start().await;
        let base = format!("{}/download", server.uri());
        Mock::given(method("GET"))
            .and(path("/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tag_name": tag,
                "assets": [
                    asset("newtsvc_linux_amd64", &base),
                    asset("newtsvc-tray_linux_amd64", &base),
                    asset("newtsvc_1.0_amd64.deb", &base),
                ]
            })))
            .mount(&server)
            .await;
        for name in ["newtsvc_linux_amd64", "newtsvc-tray_linux_amd64", "newtsvc_1.0_amd64.deb"] {
            Mock::given(method("GET"))
                .and(path(format!("/download/{}", name)))
                .respond_with(ResponseTemplate::new(200).set_body_string(format!("body of {}", name)))
                .mount(&server)
                .await;
        }
        server
    }

    fn updater(server: &MockServer, install: &Path, staging: &Path, host: Arc<FakeHost>) -> SelfUpdater {
        let client = reqwest::Client::new();
        SelfUpdater::new(
            ReleaseSource::with_client(client.clone(), format!("{}/latest", server.uri())),
            Downloader::new(client),
            install,
            staging,
        )
        .with_platform(linux())
        .with_host(host)
    }

    #[tokio::test]
    async fn check_only_reports_newer_releases() {
        let install = tempfile::tempdir().unwrap();
        let staging = install.path().join("staging");

        let server = app_server("v999.0.0").await;
        let host = Arc::new(FakeHost::exiting());
        let found = updater(&server, install.path(), &staging, host).check().await;
        assert_eq!(found.unwrap().version, "999.0.0");

        let server = app_server("v0.0.1").await;
        let host = Arc::new(FakeHost::exiting());
        assert!(updater(&server, install.path(), &staging, host).check().await.is_none());
    }

    #[tokio::test]
    async fn portable_install_stages_and_hands_off() {
        let server = app_server("v999.0.0").await;
        let install = tempfile::tempdir().unwrap();
        let staging = install.path().join("staging");
        let host = Arc::new(FakeHost::exiting());
        let updater = updater(&server, install.path(), &staging, host.clone());

        let release = updater.check().await.unwrap();
        let mut exit_requested = false;
        let outcome = updater
            .install(&release, |_| {}, || exit_requested = true)
            .await
            .unwrap();

        assert_eq!(outcome, InstallOutcome::HandoffStarted);
        assert!(exit_requested);
        assert_eq!(
            fs::read_to_string(staging.join("newtsvc")).unwrap(),
            "body of newtsvc_linux_amd64"
        );
        assert!(staging.join("newtsvc-tray").is_file());

        let launched = host.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].0, staging.join("newtsvc"));
        assert_eq!(
            launched[0].1,
            vec![
                OsString::from(APPLY_UPDATE_FLAG),
                install.path().as_os_str().to_os_string(),
                OsString::from(std::process::id().to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn managed_install_launches_the_installer() {
        let server = app_server("v999.0.0").await;
        let install = tempfile::tempdir().unwrap();
        fs::write(install.path().join(".managed-install"), "").unwrap();
        let staging = install.path().join("staging");
        let host = Arc::new(FakeHost::exiting());
        let updater = updater(&server, install.path(), &staging, host.clone());

        let release = updater.check().await.unwrap();
        let mut exit_requested = false;
        let outcome = updater
            .install(&release, |_| {}, || exit_requested = true)
            .await
            .unwrap();

        assert_eq!(outcome, InstallOutcome::InstallerLaunched);
        assert!(!exit_requested);
        let package = staging.join("newtsvc_1.0_amd64.deb");
        assert!(package.is_file());
        let launched = host.launched();
        assert_eq!(launched[0].0, PathBuf::from("xdg-open"));
        assert_eq!(launched[0].1, vec![package.clone().into_os_string()]);

        // The package goes away with the rest of the staging directory
        assert_eq!(cleanup_previous_update(install.path(), &staging, &files()), 1);
        assert!(!package.exists());
    }

    #[tokio::test]
    async fn release_without_assets_is_an_error() {
        let server = app_server("v999.0.0").await;
        let install = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::exiting());
        let updater = updater(&server, install.path(), &install.path().join("staging"), host.clone());

        let empty = AppRelease {
            tag_name: "v999.0.0".to_string(),
            version: "999.0.0".to_string(),
            installer: None,
            primary: None,
            secondary: None,
        };
        assert!(updater.install(&empty, |_| {}, || {}).await.is_err());
        assert!(host.launched().is_empty());
    }
}
