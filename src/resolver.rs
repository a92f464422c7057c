//! Artifact resolution - finds, downloads and caches the tunnel binary

use crate::config::Config;
use crate::error::{Result, RwtError};
use crate::journal::remove_if_exists;
use crate::session::Architecture;
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Release asset as listed by the GitHub releases API
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

/// Release document as returned by the GitHub releases API
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// A binary ready to run
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArtifact {
    pub asset_name: String,
    pub path: PathBuf,
    /// `false` when the cached copy was used
    pub downloaded: bool,
}

/// Pick the asset for `os`/`arch`.
///
/// An asset matches when its dash-separated name segments include both
/// tokens exactly, so `x86` never matches `x86_64`. Among several matches
/// the one with the fewest segments wins, then the lexicographically
/// smallest name.
pub fn select_asset<'a>(assets: &'a [ReleaseAsset], os: &str, arch: &str) -> Result<&'a ReleaseAsset> {
    assets
        .iter()
        .filter(|asset| !asset.browser_download_url.is_empty())
        .filter(|asset| {
            let segments: Vec<&str> = asset.name.split('-').collect();
            segments.contains(&os) && segments.contains(&arch)
        })
        .min_by(|a, b| {
            let a_len = a.name.split('-').count();
            let b_len = b.name.split('-').count();
            a_len.cmp(&b_len).then_with(|| a.name.cmp(&b.name))
        })
        .ok_or_else(|| {
            RwtError::Resolution(format!("no release asset matches os '{os}' and arch '{arch}'"))
        })
}

/// Finds the tunnel binary for this host, downloading it once
pub struct ArtifactResolver {
    project: String,
    os: String,
    index_url: String,
    bin_dir: PathBuf,
    timeout: Duration,
    attempts: u32,
    proxy_url: Option<String>,
}

impl ArtifactResolver {
    pub fn new(config: &Config) -> Self {
        let proxy_url = config.release.use_proxy.then(|| {
            format!("{}://{}:{}", config.proxy.scheme, config.proxy.host, config.proxy.port)
        });

        Self {
            project: config.release.project.clone(),
            os: config.release.os.clone(),
            index_url: config.release.index_url.clone(),
            bin_dir: config.session.workspace.join("bin"),
            timeout: config.download_timeout(),
            attempts: config.release.attempts.max(1),
            proxy_url,
        }
    }

    /// Name the release uses for this host's binary
    pub fn canonical_name(&self, arch: Architecture) -> String {
        format!("{}-{}-{}", self.project, self.os, arch.release_token())
    }

    pub fn cached_path(&self, asset_name: &str) -> PathBuf {
        self.bin_dir.join(asset_name)
    }

    /// Return the cached binary or fetch it from the release index
    pub async fn resolve(&self, arch: Architecture) -> Result<ResolvedArtifact> {
        let canonical = self.canonical_name(arch);
        let cached = self.cached_path(&canonical);
        if cached.is_file() {
            log::info!("Using cached tunnel binary {}", cached.display());
            ensure_executable(&cached)?;
            return Ok(ResolvedArtifact {
                asset_name: canonical,
                path: cached,
                downloaded: false,
            });
        }

        let client = self.http_client()?;
        let release = self.fetch_release(&client).await?;
        let asset = select_asset(&release.assets, &self.os, arch.release_token())?;
        log::info!("Selected {} from release {}", asset.name, release.tag_name);

        let path = self.cached_path(&asset.name);
        if path.is_file() {
            ensure_executable(&path)?;
            return Ok(ResolvedArtifact {
                asset_name: asset.name.clone(),
                path,
                downloaded: false,
            });
        }

        self.download(&client, asset, &path).await?;
        Ok(ResolvedArtifact {
            asset_name: asset.name.clone(),
            path,
            downloaded: true,
        })
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("pdanet-rwt/", env!("CARGO_PKG_VERSION")))
            .timeout(self.timeout);

        if let Some(ref proxy_url) = self.proxy_url {
            log::info!("Using proxy {proxy_url} for release downloads");
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| RwtError::Download(format!("Invalid proxy URL '{proxy_url}': {e}")))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        builder
            .build()
            .map_err(|e| RwtError::Download(format!("Failed to create HTTP client: {e}")))
    }

    async fn fetch_release(&self, client: &reqwest::Client) -> Result<Release> {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            log::debug!("Querying {} (attempt {attempt}/{})", self.index_url, self.attempts);
            let result = async {
                let response = client
                    .get(&self.index_url)
                    .header("Accept", "application/vnd.github+json")
                    .send()
                    .await
                    .map_err(|e| RwtError::Resolution(format!("Release index unreachable: {e}")))?;

                if !response.status().is_success() {
                    return Err(RwtError::Resolution(format!(
                        "Release index returned {}",
                        response.status()
                    )));
                }

                response
                    .json::<Release>()
                    .await
                    .map_err(|e| RwtError::Resolution(format!("Malformed release index: {e}")))
            }
            .await;

            match result {
                Ok(release) => return Ok(release),
                Err(e) => {
                    log::warn!("{e}");
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RwtError::Resolution("release index never queried".to_string())))
    }

    async fn download(&self, client: &reqwest::Client, asset: &ReleaseAsset, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.bin_dir).await?;
        let mut partial = PartialFile::new(dest.with_extension("part"));
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            log::info!(
                "Downloading {} (attempt {attempt}/{})",
                asset.browser_download_url,
                self.attempts
            );
            let result = async {
                let bytes = download_to(client, &asset.browser_download_url, partial.path()).await?;
                if asset.size > 0 && bytes != asset.size {
                    return Err(RwtError::Download(format!(
                        "expected {} bytes, got {bytes}",
                        asset.size
                    )));
                }
                Ok(bytes)
            }
            .await;

            match result {
                Ok(bytes) => {
                    partial.commit(dest).await?;
                    ensure_executable(dest)?;
                    log::info!("Downloaded {} ({bytes} bytes)", dest.display());
                    return Ok(());
                }
                Err(e) => {
                    partial.discard();
                    log::warn!("{e}");
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RwtError::Download("download never attempted".to_string())))
    }
}

/// A download in progress. Removed on drop unless committed, so an
/// abandoned download leaves nothing behind.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, committed: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn discard(&self) {
        if let Err(e) = remove_if_exists(&self.path) {
            log::warn!("Could not remove {}: {e}", self.path.display());
        }
    }

    /// Move the finished download into place
    async fn commit(&mut self, dest: &Path) -> Result<()> {
        tokio::fs::rename(&self.path, dest).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            self.discard();
        }
    }
}

async fn download_to(client: &reqwest::Client, url: &str, dest: &Path) -> Result<u64> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| RwtError::Download(format!("Download request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(RwtError::Download(format!(
            "Download failed with status: {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| RwtError::Download(format!("Error reading chunk: {e}")))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(written)
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.saturating_sub(1).min(4))
}

#[cfg(unix)]
fn ensure_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    if perms.mode() & 0o111 != 0o111 {
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn asset(name: &str) -> ReleaseAsset {
        ReleaseAsset {
            name: name.to_string(),
            browser_download_url: format!("https://example.invalid/{name}"),
            size: 0,
        }
    }

    #[test]
    fn test_select_asset_exact_tokens() {
        let assets = vec![
            asset("hev-socks5-tunnel-linux-x86"),
            asset("hev-socks5-tunnel-linux-x86_64"),
            asset("hev-socks5-tunnel-linux-arm64"),
            asset("hev-socks5-tunnel-darwin-x86_64"),
        ];

        let picked = select_asset(&assets, "linux", "x86_64").unwrap();
        assert_eq!(picked.name, "hev-socks5-tunnel-linux-x86_64");

        let picked = select_asset(&assets, "linux", "x86").unwrap();
        assert_eq!(picked.name, "hev-socks5-tunnel-linux-x86");
    }

    #[test]
    fn test_select_asset_is_deterministic() {
        let a = vec![
            asset("hev-socks5-tunnel-linux-arm64-static"),
            asset("hev-socks5-tunnel-linux-arm64"),
            asset("hev-socks5-tunnel-linux-arm64-debug"),
        ];
        let mut b = a.clone();
        b.reverse();

        assert_eq!(select_asset(&a, "linux", "arm64").unwrap().name, "hev-socks5-tunnel-linux-arm64");
        assert_eq!(select_asset(&b, "linux", "arm64").unwrap().name, "hev-socks5-tunnel-linux-arm64");

        let ties = vec![asset("tun-linux-arm64-musl"), asset("tun-linux-arm64-gnu")];
        assert_eq!(select_asset(&ties, "linux", "arm64").unwrap().name, "tun-linux-arm64-gnu");
    }

    #[test]
    fn test_select_asset_ignores_checksums_and_missing_urls() {
        let mut no_url = asset("hev-socks5-tunnel-linux-x86_64");
        no_url.browser_download_url.clear();
        let assets = vec![no_url, asset("hev-socks5-tunnel-linux-x86_64.sha256")];

        let err = select_asset(&assets, "linux", "x86_64").unwrap_err();
        assert!(matches!(err, RwtError::Resolution(_)));
    }

    #[test]
    fn test_release_json_parsing() {
        let json = r#"{
            "tag_name": "2.7.5",
            "assets": [
                {"name": "hev-socks5-tunnel-linux-arm64", "browser_download_url": "https://github.com/x/arm64", "size": 42}
            ]
        }"#;
        let release: Release = serde_json::from_str(json).unwrap();
        assert_eq!(release.tag_name, "2.7.5");
        assert_eq!(release.assets[0].size, 42);
    }

    const BINARY: &[u8] = b"\x7fELF tunnel build";
    const ASSET: &str = "hev-socks5-tunnel-linux-x86_64";

    /// Answer HTTP requests on `listener` with `respond(path, hit)`, where
    /// `hit` counts requests for that path starting at 1
    fn serve(listener: TcpListener, respond: impl Fn(&str, usize) -> (u16, Vec<u8>) + Send + Sync + 'static) {
        let respond = Arc::new(respond);
        let hits = Arc::new(Mutex::new(HashMap::<String, usize>::new()));

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let respond = respond.clone();
                let hits = hits.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&chunk[..n]),
                        }
                    }

                    let request = String::from_utf8_lossy(&request);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let hit = {
                        let mut hits = hits.lock().unwrap();
                        let count = hits.entry(path.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };

                    let (status, body) = respond(&path, hit);
                    let head = format!(
                        "HTTP/1.1 {status} Canned\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
    }

    /// A release index on a local listener whose single asset is served by
    /// `asset`
    async fn release_server(
        asset: impl Fn(usize) -> (u16, Vec<u8>) + Send + Sync + 'static,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let index = format!(
            r#"{{"tag_name": "2.7.5", "assets": [
                {{"name": "{ASSET}.sha256", "browser_download_url": "{base}/download/{ASSET}.sha256", "size": 64}},
                {{"name": "{ASSET}", "browser_download_url": "{base}/download/{ASSET}", "size": {}}}
            ]}}"#,
            BINARY.len()
        );

        serve(listener, move |path, hit| match path {
            "/releases/latest" => (200, index.clone().into_bytes()),
            p if p == format!("/download/{ASSET}") => asset(hit),
            _ => (404, b"Not Found".to_vec()),
        });
        format!("{base}/releases/latest")
    }

    fn download_config(workspace: &Path, index_url: String, attempts: u32) -> Config {
        let mut config = Config::default();
        config.session.workspace = workspace.to_path_buf();
        config.release.index_url = index_url;
        config.release.attempts = attempts;
        config.release.timeout = 10;
        config.release.use_proxy = false;
        config
    }

    fn bin_entries(workspace: &Path) -> Vec<String> {
        std::fs::read_dir(workspace.join("bin"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_download_installs_executable() {
        let dir = tempfile::tempdir().unwrap();
        let index = release_server(|_| (200, BINARY.to_vec())).await;
        let resolver = ArtifactResolver::new(&download_config(dir.path(), index, 1));

        let artifact = resolver.resolve(Architecture::X86_64).await.unwrap();
        assert!(artifact.downloaded);
        assert_eq!(artifact.asset_name, ASSET);
        assert_eq!(artifact.path, resolver.cached_path(ASSET));
        assert_eq!(std::fs::read(&artifact.path).unwrap(), BINARY);
        assert_eq!(bin_entries(dir.path()), vec![ASSET.to_string()]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&artifact.path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        // Second run is served from the cache
        let again = resolver.resolve(Architecture::X86_64).await.unwrap();
        assert!(!again.downloaded);
    }

    #[tokio::test]
    async fn test_missing_asset_is_download_error() {
        let dir = tempfile::tempdir().unwrap();
        let index = release_server(|_| (404, b"Not Found".to_vec())).await;
        let resolver = ArtifactResolver::new(&download_config(dir.path(), index, 1));

        let err = resolver.resolve(Architecture::X86_64).await.unwrap_err();
        assert!(matches!(err, RwtError::Download(_)), "{err:?}");
        assert!(bin_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_short_download_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let index = release_server(|hit| {
            if hit == 1 {
                (200, BINARY[..4].to_vec())
            } else {
                (200, BINARY.to_vec())
            }
        })
        .await;
        let resolver = ArtifactResolver::new(&download_config(dir.path(), index, 2));

        let artifact = resolver.resolve(Architecture::X86_64).await.unwrap();
        assert!(artifact.downloaded);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), BINARY);
        assert_eq!(bin_entries(dir.path()), vec![ASSET.to_string()]);
    }

    #[tokio::test]
    async fn test_short_download_fails_after_last_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let index = release_server(|_| (200, BINARY[..4].to_vec())).await;
        let resolver = ArtifactResolver::new(&download_config(dir.path(), index, 1));

        let err = resolver.resolve(Architecture::X86_64).await.unwrap_err();
        assert!(matches!(err, RwtError::Download(_)), "{err:?}");
        assert!(bin_entries(dir.path()).is_empty());
    }

    #[test]
    fn test_abandoned_download_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{ASSET}.part"));
        std::fs::write(&path, &BINARY[..4]).unwrap();

        drop(PartialFile::new(path.clone()));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_cached_binary_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.session.workspace = dir.path().to_path_buf();
        // Unroutable index: any network access would fail the test
        config.release.index_url = "http://127.0.0.1:9/never".to_string();

        let resolver = ArtifactResolver::new(&config);
        let name = resolver.canonical_name(Architecture::X86_64);
        let path = resolver.cached_path(&name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();

        let artifact = resolver.resolve(Architecture::X86_64).await.unwrap();
        assert_eq!(artifact.path, path);
        assert!(!artifact.downloaded);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
