use anyhow::{anyhow, Context, Result};
use futures_util::{Stream, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Largest slice written (and reported) at a time.
pub const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Streams `url` into `dest`, calling `on_progress` with a percentage after each slice.
    ///
    /// Progress is only reported when the server announces a content length. The
    /// body lands in a `.part` sibling first and is renamed onto `dest` once
    /// complete, so `dest` never holds a partial file.
    pub async fn download<F>(&self, url: &str, dest: &Path, on_progress: F) -> Result<u64>
    where
        F: FnMut(f64),
    {
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| dest.display().to_string());
        tracing::info!("Downloading {}...", file_name);
        tracing::debug!("Downloading from: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Download request for {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Download failed: {}", status));
        }

        let total = response.content_length().filter(|len| *len > 0);
        match total {
            Some(len) => tracing::info!("Download size: {:.1} MB", len as f64 / 1024.0 / 1024.0),
            None => tracing::info!("Download size unknown"),
        }

        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part)
            .await
            .with_context(|| format!("Could not create {}", part.display()))?;

        let written = match write_stream(response.bytes_stream(), &mut file, total, on_progress).await
        {
            Ok(written) => written,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&part, dest)
            .await
            .with_context(|| format!("Could not move download into {}", dest.display()))?;

        tracing::info!("Download complete: {} bytes", written);
        Ok(written)
    }
}

/// Copies a byte stream into `writer` in slices of at most [`CHUNK_SIZE`] bytes.
///
/// With a known `total`, `on_progress` receives `written / total * 100` after
/// every slice; without one it is never called.
pub async fn write_stream<S, B, E, W, F>(
    mut stream: S,
    writer: &mut W,
    total: Option<u64>,
    mut on_progress: F,
) -> Result<u64>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<anyhow::Error>,
    W: AsyncWrite + Unpin,
    F: FnMut(f64),
{
    let total = total.filter(|len| *len > 0);
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(Into::into)?;
        for slice in chunk.as_ref().chunks(CHUNK_SIZE) {
            writer.write_all(slice).await?;
            written += slice.len() as u64;

            if let Some(total) = total {
                on_progress((written as f64 / total as f64 * 100.0).min(100.0));
            }
        }
    }

    writer.flush().await?;
    Ok(written)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Terminal progress bar measured in percent.
pub fn progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{msg} {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(message.to_string());
    pb
}

/// Progress callback for headless use: logs each time another tenth completes.
pub fn log_progress(label: &str) -> impl FnMut(f64) {
    let label = label.to_string();
    let mut next_step = 10.0;
    move |percent| {
        if percent >= next_step {
            tracing::info!("{} download progress: {:.1}%", label, percent);
            while next_step <= percent {
                next_step += 10.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chunks(sizes: &[usize]) -> Vec<Result<Vec<u8>, std::io::Error>> {
        sizes.iter().map(|size| Ok(vec![7u8; *size])).collect()
    }

    #[tokio::test]
    async fn known_length_reports_monotonic_progress_ending_at_100() {
        let mut out = Vec::new();
        let mut seen = Vec::new();
        let written = write_stream(
            stream::iter(chunks(&[20_000, 5_000])),
            &mut out,
            Some(25_000),
            |p| seen.push(p),
        )
        .await
        .unwrap();

        assert_eq!(written, 25_000);
        assert_eq!(out.len(), 25_000);
        // 20_000 bytes split into three slices, then one more
        assert_eq!(seen.len(), 4);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 100.0);
    }

    #[tokio::test]
    async fn unknown_length_reports_nothing() {
        let mut out = Vec::new();
        let mut calls = 0;
        write_stream(stream::iter(chunks(&[10_000, 10])), &mut out, None, |_| calls += 1)
            .await
            .unwrap();
        assert_eq!(out.len(), 10_010);
        assert_eq!(calls, 0);

        write_stream(stream::iter(chunks(&[3])), &mut out, Some(0), |_| calls += 1)
            .await
            .unwrap();
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn stream_errors_propagate() {
        let items: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(vec![1, 2, 3]),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut out = Vec::new();
        let result = write_stream(stream::iter(items), &mut out, Some(10), |_| {}).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn downloads_to_destination_without_leftovers() {
        let server = MockServer::start().await;
        let body = vec![42u8; 30_000];
        Mock::given(method("GET"))
            .and(path("/newt_linux_amd64"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("newt");
        let mut seen = Vec::new();
        let downloader = Downloader::new(reqwest::Client::new());
        let written = downloader
            .download(&format!("{}/newt_linux_amd64", server.uri()), &dest, |p| seen.push(p))
            .await
            .unwrap();

        assert_eq!(written, 30_000);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!dir.path().join("newt.part").exists());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 100.0);
    }

    #[tokio::test]
    async fn failed_status_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("newt");
        let downloader = Downloader::new(reqwest::Client::new());
        let result = downloader
            .download(&format!("{}/missing", server.uri()), &dest, |_| {})
            .await;

        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!dir.path().join("newt.part").exists());
    }

    #[test]
    fn part_file_sits_next_to_destination() {
        assert_eq!(
            part_path(Path::new("/data/newt.exe")),
            PathBuf::from("/data/newt.exe.part")
        );
    }
}
