//! Streaming downloads through the Earthdata authentication redirect chain.
//!
//! A data URL answers with a 302 to the URS login endpoint, which in turn
//! redirects back to the data URL once credentials have been accepted. The
//! request that returns to an already visited URL is the one carrying the
//! content, so loop closure is the termination signal rather than an error.
use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::transport::Transport;
use futures_util::StreamExt;
use regex::Regex;
use reqwest::{header, Response};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};
use url::Url;

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).expect("Regex pattern should always compile")
});

/// State of one redirect walk. Created per download and dropped afterwards.
#[derive(Debug)]
pub struct DownloadSession {
    visited: Vec<Url>,
    max_hops: usize,
}

impl DownloadSession {
    pub fn new(max_hops: usize) -> Self {
        Self {
            visited: vec![],
            max_hops,
        }
    }

    pub fn visited(&self) -> &[Url] {
        &self.visited
    }

    fn has_visited(&self, url: &Url) -> bool {
        self.visited.contains(url)
    }

    fn record(&mut self, url: Url) -> Result<()> {
        if self.visited.len() >= self.max_hops {
            let origin = self.visited.first().unwrap_or(&url).to_string();
            return Err(Error::RedirectLoop {
                url: origin,
                hops: self.max_hops,
            });
        }
        self.visited.push(url);
        Ok(())
    }
}

/// Terminal response of a redirect walk, with the body still unread.
#[derive(Debug)]
pub struct Resolved {
    pub url: Url,
    pub response: Response,
    pub session: DownloadSession,
}

#[derive(Debug, Clone)]
pub struct Downloader {
    transport: Transport,
    max_hops: usize,
}

impl Downloader {
    pub fn new(transport: Transport, max_hops: usize) -> Self {
        Self {
            transport,
            max_hops,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Walk redirects from `url` until a success response or a revisit.
    ///
    /// Credentials, when given, are attached to every hop.
    pub async fn resolve(&self, url: &str, credentials: Option<&Credentials>) -> Result<Resolved> {
        let mut session = DownloadSession::new(self.max_hops);
        let mut current = Url::parse(url)?;

        loop {
            let revisit = session.has_visited(&current);
            let response = self.get(&current, credentials).await?;
            let status = response.status();

            // Coming back to a visited URL closes the login loop: this response
            // is the content, whatever its status.
            if status.is_success() || revisit {
                debug!(
                    url = %current,
                    status = %status,
                    hops = session.visited().len(),
                    "Resolved download"
                );
                return Ok(Resolved {
                    url: current,
                    response,
                    session,
                });
            }
            if !status.is_redirection() {
                return Err(Error::Authentication {
                    url: current.to_string(),
                    status: status.as_u16(),
                });
            }

            let next = next_location(&current, response).await?;
            debug!(from = %current, to = %next, "Following redirect");
            session.record(current)?;
            current = next;
        }
    }

    /// Resolve `url` and stream its body to `output_dir/{basename}`.
    #[instrument(skip(self, credentials, output_dir), fields(auth = credentials.is_some()))]
    pub async fn download(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
        output_dir: &Path,
    ) -> Result<PathBuf> {
        let filename = basename(url)?;
        let output = output_dir.join(&filename);
        fs::create_dir_all(output_dir).await?;

        let resolved = self.resolve(url, credentials).await?;
        let bytes = stream_to_file(resolved.response, &output).await?;

        info!(path = %output.display(), bytes = bytes, "Download complete");
        Ok(output)
    }

    async fn get(&self, url: &Url, credentials: Option<&Credentials>) -> Result<Response> {
        let mut request = self.transport.client().get(url.clone());
        if let Some(credentials) = credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }
        self.transport.send(request).await
    }
}

/// Last path segment of `url`, used as the local filename.
pub fn basename(url: &str) -> Result<String> {
    let parsed = Url::parse(url)?;
    parsed
        .path_segments()
        .and_then(|segments| segments.last())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Transport {
            url: url.to_string(),
            attempts: 0,
            reason: "URL has no filename".to_string(),
        })
}

/// Target of a redirect: the `Location` header, or failing that the first
/// `href` in the body (the URS login page embeds it there).
async fn next_location(current: &Url, response: Response) -> Result<Url> {
    if let Some(location) = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
    {
        return Ok(current.join(location)?);
    }

    let status = response.status().as_u16();
    let body = response.text().await?;
    match HREF_RE.captures(&body).and_then(|c| c.get(1)) {
        Some(href) => Ok(current.join(href.as_str())?),
        None => Err(Error::Authentication {
            url: current.to_string(),
            status,
        }),
    }
}

async fn stream_to_file(response: Response, path: &Path) -> Result<u64> {
    let file = File::create(path).await?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

    let mut stream = response.bytes_stream();
    let mut byte_count = 0_u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        byte_count += chunk.len() as u64;
    }
    writer.flush().await?;

    Ok(byte_count)
}
