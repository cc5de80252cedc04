use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, HeaderMap, HeaderValue, RANGE, USER_AGENT};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{Accession, MaxSpeed};
use crate::error::SraError;
use crate::partition::partition;

pub const SRA_BUCKET: &str = "sra-pub-run-odp";
const COPY_BUFFER: usize = 64 * 1024;

pub fn object_uri(accession: &Accession) -> String {
    format!("s3://{SRA_BUCKET}/sra/{0}/{0}", accession.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemoteObject {
    pub size: Option<u64>,
    pub accepts_ranges: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadPlan {
    pub concurrency: usize,
    pub max_speed: Option<MaxSpeed>,
}

pub trait ObjectStore: Send + Sync {
    /// Existence check; a missing object is `RemoteNotFound`.
    fn head(&self, accession: &Accession) -> Result<RemoteObject, SraError>;
    fn download(
        &self,
        accession: &Accession,
        object: &RemoteObject,
        destination: &Path,
        plan: &DownloadPlan,
    ) -> Result<u64, SraError>;
}

/// Anonymous HTTPS access to the public SRA bucket.
#[derive(Clone)]
pub struct S3HttpClient {
    client: Client,
    base_url: String,
}

impl S3HttpClient {
    pub fn new() -> Result<Self, SraError> {
        Self::with_base_url(format!("https://{SRA_BUCKET}.s3.amazonaws.com"))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, SraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-srautils/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SraError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| SraError::Http(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn object_url(&self, accession: &Accession) -> String {
        format!(
            "{}/sra/{1}/{1}",
            self.base_url.trim_end_matches('/'),
            accession.as_str()
        )
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, SraError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(SraError::Http(err.to_string()));
                }
            }
        }
    }

    fn fetch_range(
        &self,
        url: &str,
        destination: &Path,
        offset: u64,
        last: u64,
        limit: Option<u64>,
    ) -> Result<u64, SraError> {
        let response = self.send_with_retries(|| {
            self.client
                .get(url)
                .header(RANGE, format!("bytes={offset}-{last}"))
        })?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(status_error(response));
        }
        let mut file = OpenOptions::new()
            .write(true)
            .open(destination)
            .map_err(|err| SraError::Filesystem(err.to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| SraError::Filesystem(err.to_string()))?;
        let written = copy_throttled(response, &mut file, limit)?;
        let expected = last - offset + 1;
        if written != expected {
            return Err(SraError::Http(format!(
                "short read for bytes {offset}-{last}: got {written} of {expected}"
            )));
        }
        Ok(written)
    }

    fn fetch_whole(&self, url: &str, destination: &Path, limit: Option<u64>) -> Result<u64, SraError> {
        let response = self.send_with_retries(|| self.client.get(url))?;
        if !response.status().is_success() {
            return Err(status_error(response));
        }
        let mut file =
            File::create(destination).map_err(|err| SraError::Filesystem(err.to_string()))?;
        copy_throttled(response, &mut file, limit)
    }
}

impl ObjectStore for S3HttpClient {
    fn head(&self, accession: &Accession) -> Result<RemoteObject, SraError> {
        let url = self.object_url(accession);
        // any failed existence check, after retries, reads as "no such id"
        let response = match self.send_with_retries(|| self.client.head(&url)) {
            Ok(response) => response,
            Err(err) => {
                warn!(%url, error = %err, "existence check failed");
                return Err(SraError::RemoteNotFound(accession.to_string()));
            }
        };
        let status = response.status();
        if !status.is_success() {
            if !matches!(status, StatusCode::NOT_FOUND | StatusCode::FORBIDDEN) {
                warn!(%url, status = status.as_u16(), "existence check failed");
            }
            return Err(SraError::RemoteNotFound(accession.to_string()));
        }
        let headers = response.headers();
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        Ok(RemoteObject {
            size,
            accepts_ranges,
        })
    }

    fn download(
        &self,
        accession: &Accession,
        object: &RemoteObject,
        destination: &Path,
        plan: &DownloadPlan,
    ) -> Result<u64, SraError> {
        let url = self.object_url(accession);
        let ranged = match object.size {
            Some(size) if object.accepts_ranges && size > 0 && plan.concurrency > 1 => Some(size),
            _ => None,
        };
        let Some(size) = ranged else {
            debug!(%url, "single stream download");
            return self.fetch_whole(&url, destination, plan.max_speed.map(|s| s.bytes_per_sec()));
        };

        let parts = (plan.concurrency as u64).min(size);
        let ranges = partition(size, parts)?;
        let limit = plan
            .max_speed
            .map(|speed| (speed.bytes_per_sec() / parts).max(1));
        let file =
            File::create(destination).map_err(|err| SraError::Filesystem(err.to_string()))?;
        file.set_len(size)
            .map_err(|err| SraError::Filesystem(err.to_string()))?;
        drop(file);
        info!(parts, size, "ranged download");

        let results = thread::scope(|scope| {
            let handles = ranges
                .iter()
                .map(|range| {
                    let url = url.as_str();
                    scope.spawn(move || {
                        self.fetch_range(url, destination, range.start - 1, range.end - 1, limit)
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(SraError::Http("download worker panicked".to_string())))
                })
                .collect::<Vec<_>>()
        });
        results.into_iter().sum()
    }
}

/// Paces cumulative throughput to at most `limit` bytes per second.
#[derive(Debug)]
pub struct Throttle {
    limit: Option<u64>,
    started: Instant,
    bytes: u64,
}

impl Throttle {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            started: Instant::now(),
            bytes: 0,
        }
    }

    /// How long to wait after `n` more bytes to stay under the limit.
    pub fn consume(&mut self, n: u64) -> Duration {
        self.bytes += n;
        let Some(limit) = self.limit else {
            return Duration::ZERO;
        };
        let due = Duration::from_secs_f64(self.bytes as f64 / limit as f64);
        due.saturating_sub(self.started.elapsed())
    }
}

fn copy_throttled<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    limit: Option<u64>,
) -> Result<u64, SraError> {
    let mut throttle = Throttle::new(limit);
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|err| SraError::Http(err.to_string()))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|err| SraError::Filesystem(err.to_string()))?;
        total += n as u64;
        let wait = throttle.consume(n as u64);
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }
    writer
        .flush()
        .map_err(|err| SraError::Filesystem(err.to_string()))?;
    Ok(total)
}

fn status_error(response: Response) -> SraError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "object store request failed".to_string());
    SraError::HttpStatus { status, message }
}

pub fn part_path(destination: &Path) -> std::path::PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    name.into()
}

pub fn finalize_download(part: &Path, destination: &Path) -> Result<(), SraError> {
    fs::rename(part, destination).map_err(|err| SraError::Filesystem(err.to_string()))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
