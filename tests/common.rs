use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Address nothing listens on, so release lookups fail fast.
pub const UNREACHABLE: &str = "http://127.0.0.1:9";

// Not every test binary uses every helper
#[allow(dead_code)]
pub struct TestContext {
    pub temp_dir: TempDir,
    pub data_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub bin_path: PathBuf,
    pub client_releases_url: String,
    pub app_releases_url: String,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let data_dir = temp_dir.path().join("data");
        let staging_dir = temp_dir.path().join("staging");

        Self {
            data_dir,
            staging_dir,
            bin_path: PathBuf::from(env!("CARGO_BIN_EXE_newtsvc")),
            client_releases_url: format!("{}/releases", UNREACHABLE),
            app_releases_url: format!("{}/latest", UNREACHABLE),
            temp_dir,
        }
    }

    pub fn with_client_releases(mut self, url: impl Into<String>) -> Self {
        self.client_releases_url = url.into();
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn cmd(&self) -> Command {
        let mut cmd = Command::new(&self.bin_path);
        cmd.env("NEWTSVC_DATA_DIR", &self.data_dir);
        cmd.env("NEWTSVC_STAGING_DIR", &self.staging_dir);
        cmd.env("NEWTSVC_CLIENT_RELEASES_URL", &self.client_releases_url);
        cmd.env("NEWTSVC_APP_RELEASES_URL", &self.app_releases_url);
        // Keep the fallback log inside the test directory
        cmd.env("TMPDIR", self.temp_dir.path());
        for var in [
            "NEWTSVC_ENDPOINT",
            "NEWTSVC_ID",
            "NEWTSVC_SECRET",
            "NEWTSVC_CHECK_INTERVAL_SECS",
            "NEWTSVC_INCLUDE_PRERELEASE",
            "GITHUB_TOKEN",
            "RUST_LOG",
        ] {
            cmd.env_remove(var);
        }
        cmd
    }
}

#[allow(dead_code)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: std::process::ExitStatus,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status: output.status,
        }
    }
}

#[allow(dead_code)]
impl CommandOutput {
    pub fn assert_success(&self) -> &Self {
        if !self.status.success() {
            panic!(
                "Command failed with status {:?}\nstdout: {}\nstderr: {}",
                self.status.code(),
                self.stdout,
                self.stderr
            );
        }
        self
    }

    pub fn assert_failure(&self) -> &Self {
        assert!(
            !self.status.success(),
            "Command unexpectedly succeeded\nstdout: {}\nstderr: {}",
            self.stdout,
            self.stderr
        );
        self
    }

    pub fn assert_stdout_contains(&self, text: &str) -> &Self {
        assert!(
            self.stdout.contains(text),
            "Stdout did not contain '{}'\nActual stdout: {}",
            text,
            self.stdout
        );
        self
    }

    pub fn assert_stderr_contains(&self, text: &str) -> &Self {
        assert!(
            self.stderr.contains(text),
            "Stderr did not contain '{}'\nActual stderr: {}",
            text,
            self.stderr
        );
        self
    }
}
