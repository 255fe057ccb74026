mod cli;
mod client_log;
mod config;
mod download;
mod install;
mod platform;
mod release;
mod self_update;
mod service;
mod supervisor;
mod types;
mod version;


use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use cli::{get_version, Cli, Commands, ConfigAction};
use client_log::ClientLog;
use config::{
    app_releases_url, client_releases_url, get_config_value, load_config, normalize_key,
    read_config_file, redacted_config, save_config, set_config_value, unset_config_value,
    AppPaths, CONFIG_KEYS, REDACTED, SERVICE_LOGS_KEPT, SERVICE_LOG_PREFIX,
};
use console::style;
use download::{progress_bar, Downloader};
use install::{read_installed_version, ClientInstaller};
use platform::get_system_info;
use release::{http_client, ReleaseSource};
use self_update::{
    cleanup_previous_update, current_version, managed_files, run_apply_mode,
    write_fallback_log, InstallOutcome, SelfUpdater,
};
use service::SupervisionLoop;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The staged binary must not touch the install it is about to replace
    if let Some(values) = cli.apply_update.as_deref() {
        setup_logging(&cli, None)?;
        return run_apply_update(values).await;
    }

    let paths = AppPaths::resolve()?;
    paths.ensure_dirs()?;

    let service_log_dir =
        matches!(cli.command, None | Some(Commands::Run)).then_some(paths.log_dir.as_path());
    let _log_guard = setup_logging(&cli, service_log_dir)?;
    cleanup_on_startup(&paths);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(paths).await?,
        Commands::Status => show_status(&paths),
        Commands::Check { prerelease } => check_updates(&paths, prerelease).await?,
        Commands::UpdateClient { prerelease, force } => {
            update_client(&paths, prerelease, force).await?
        }
        Commands::SelfUpdate => run_self_update(&paths).await?,
        Commands::Config { action } => handle_config(&paths, action)?,
        Commands::Version => println!("newtsvc {}", get_version()),
    }

    Ok(())
}

/// Logs to stderr, and for the long-running service also to a rotating file
/// in `log_dir`. The returned guard flushes the file writer when dropped.
fn setup_logging(cli: &Cli, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let serving = matches!(cli.command, None | Some(Commands::Run)) || cli.apply_update.is_some();
    let level = if cli.quiet {
        "error"
    } else if cli.verbose == 0 {
        if serving {
            "info"
        } else {
            "warn"
        }
    } else if cli.verbose == 1 {
        "info"
    } else {
        "debug"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(SERVICE_LOG_PREFIX)
                .filename_suffix("log")
                .max_log_files(SERVICE_LOGS_KEPT)
                .build(dir)
                .with_context(|| format!("Could not open service log in {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

async fn run_apply_update(values: &[String]) -> Result<()> {
    let [dir, pid] = values else {
        bail!("--apply-update expects <DIR> <PID>");
    };
    let install_dir = PathBuf::from(dir);
    let pid: u32 = pid.parse().map_err(|_| {
        let message = format!("Apply update failed: invalid pid '{}'", pid);
        write_fallback_log(&message);
        anyhow!(message)
    })?;

    tokio::task::spawn_blocking(move || run_apply_mode(&install_dir, pid)).await??;
    Ok(())
}

fn cleanup_on_startup(paths: &AppPaths) {
    let install_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .unwrap_or_default();
    let removed = cleanup_previous_update(
        &install_dir,
        &paths.staging_dir,
        &managed_files(&get_system_info()),
    );
    if removed > 0 {
        tracing::info!("Cleaned up {} leftover(s) from a previous update", removed);
    }
}

async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Could not listen for SIGTERM: {}", e);
                ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c().await;

    tracing::info!("Shutdown requested");
    cancel.cancel();
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn client_installer(paths: &AppPaths, client: &reqwest::Client) -> ClientInstaller {
    ClientInstaller::new(
        ReleaseSource::with_client(client.clone(), client_releases_url()),
        Downloader::new(client.clone()),
        paths.clone(),
    )
}

fn app_updater(paths: &AppPaths, client: &reqwest::Client) -> Result<SelfUpdater> {
    SelfUpdater::for_current_exe(
        ReleaseSource::with_client(client.clone(), app_releases_url()),
        Downloader::new(client.clone()),
        &paths.staging_dir,
    )
}

async fn run_service(paths: AppPaths) -> Result<()> {
    tracing::info!("newtsvc {} starting", get_version());
    tracing::debug!("Data directory: {}", paths.data_dir.display());

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown_signal(cancel.clone()));

    let client = http_client();
    let client_log = ClientLog::open(paths.client_log_file());
    let mut service = SupervisionLoop::new(
        paths.clone(),
        client_installer(&paths, &client),
        client_log,
        cancel,
    );
    match app_updater(&paths, &client) {
        Ok(updater) => service = service.with_app_updater(updater),
        Err(e) => tracing::warn!("App updates disabled: {:#}", e),
    }

    service.run().await?;
    tracing::info!("newtsvc stopped");
    Ok(())
}

fn show_status(paths: &AppPaths) {
    let config = load_config(&paths.config_file);
    let not_set = || style("(not set)").dim().to_string();

    println!("{}", style("--- newtsvc status ---").bold());
    println!("  newtsvc:    {}", get_version());

    let newt = match (
        paths.client_executable.is_file(),
        read_installed_version(&paths.version_file),
    ) {
        (true, Some(version)) => style(version).green().to_string(),
        (true, None) => style("installed (unknown version)").yellow().to_string(),
        (false, _) => style("not installed").red().to_string(),
    };
    println!("  Newt:       {}", newt);
    println!("  Endpoint:   {}", config.endpoint.clone().unwrap_or_else(not_set));
    println!("  ID:         {}", config.id.clone().unwrap_or_else(not_set));
    println!(
        "  Secret:     {}",
        if config.secret.as_deref().is_some_and(|s| !s.is_empty()) {
            REDACTED.to_string()
        } else {
            not_set()
        }
    );
    println!("  Executable: {}", paths.client_executable.display());
    println!("  Config:     {}", paths.config_file.display());
    println!("  Client log: {}", paths.client_log_file().display());
}

async fn check_updates(paths: &AppPaths, prerelease: bool) -> Result<()> {
    let client = http_client();
    let installer = client_installer(paths, &client);

    let installed = installer.installed_version();
    match installer.latest_release(prerelease).await {
        Some(latest) if installed.as_deref() == Some(latest.tag_name.as_str()) => {
            println!("Newt {} is up to date", latest.tag_name);
        }
        Some(latest) => println!(
            "Newt update available: {} -> {}",
            installed.as_deref().unwrap_or("(none)"),
            style(&latest.tag_name).green()
        ),
        None => println!("{}", style("Could not determine the latest Newt release").yellow()),
    }

    match app_updater(paths, &client)?.check().await {
        Some(release) => println!(
            "newtsvc update available: {} -> {}",
            current_version(),
            style(&release.version).green()
        ),
        None => println!("newtsvc {} is up to date", current_version()),
    }

    Ok(())
}

async fn update_client(paths: &AppPaths, prerelease: bool, force: bool) -> Result<()> {
    let client = http_client();
    let installer = client_installer(paths, &client);

    let release = installer
        .latest_release(prerelease)
        .await
        .ok_or_else(|| anyhow!("Could not determine the latest Newt release"))?;
    if !force && installer.installed_version().as_deref() == Some(release.tag_name.as_str()) {
        println!("Newt {} is up to date", release.tag_name);
        return Ok(());
    }

    let pb = progress_bar("Newt");
    let result = installer
        .install(&release, |percent| pb.set_position(percent as u64))
        .await;
    pb.finish_and_clear();
    result?;

    println!("{} Newt {}", style("Installed").green(), release.tag_name);
    Ok(())
}

async fn run_self_update(paths: &AppPaths) -> Result<()> {
    let client = http_client();
    let updater = app_updater(paths, &client)?;

    let Some(release) = updater.check().await else {
        println!("newtsvc {} is up to date", current_version());
        return Ok(());
    };

    let pb = progress_bar("newtsvc");
    let result = updater
        .install(&release, |percent| pb.set_position(percent as u64), || {})
        .await;
    pb.finish_and_clear();

    match result? {
        InstallOutcome::InstallerLaunched => {
            println!("Installer for newtsvc {} launched", release.version)
        }
        InstallOutcome::HandoffStarted => println!(
            "newtsvc {} staged; it will finish installing once this process exits",
            release.version
        ),
    }
    Ok(())
}

fn handle_config(paths: &AppPaths, action: ConfigAction) -> Result<()> {
    let mut config = read_config_file(&paths.config_file)?.unwrap_or_default();

    match action {
        ConfigAction::Get { key: Some(key) } => {
            let value = get_config_value(&redacted_config(&config), &key)?;
            println!("{}", value);
        }
        ConfigAction::Get { key: None } => {
            let shown = redacted_config(&config);
            println!("--- newtsvc settings ---");
            for key in CONFIG_KEYS {
                println!("  {}: {}", key, get_config_value(&shown, key)?);
            }
        }
        ConfigAction::Set { args } => {
            let (key, value) = split_key_value(&args)?;
            set_config_value(&mut config, &key, &value)?;
            save_config(&paths.config_file, &config)?;
            println!("Setting '{}' updated", normalize_key(&key));
        }
        ConfigAction::Unset { key } => {
            unset_config_value(&mut config, &key)?;
            save_config(&paths.config_file, &config)?;
            println!("Setting '{}' unset", normalize_key(&key));
        }
        ConfigAction::Show { format } => {
            let shown = redacted_config(&config);
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&shown)?),
                "yaml" => print!("{}", serde_yaml::to_string(&shown)?),
                "plain" => {
                    for key in CONFIG_KEYS {
                        println!("{}={}", key, get_config_value(&shown, key)?);
                    }
                }
                other => bail!("Unknown format '{}'. Use json, yaml or plain", other),
            }
        }
    }

    Ok(())
}

/// Accepts both `key=value` and `key value...`.
fn split_key_value(args: &[String]) -> Result<(String, String)> {
    match args {
        [single] => single
            .split_once('=')
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .ok_or_else(|| anyhow!("Invalid format. Use 'key=value' or 'key value'.")),
        [key, rest @ ..] => Ok((key.clone(), rest.join(" "))),
        [] => bail!("Missing key and value"),
    }
}
