//! Streaming HTTP transfer: the reference unit of work

use crate::core::work::{TaskContext, UnitOfWork};
use crate::download::retry::{RetryConfig, RetryExecutor};
use crate::error::DlError;
use crate::utils::{filename_from_url, parse_http_url, unique_path};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// HTTP transfer configuration
#[derive(Debug, Clone)]
pub struct HttpTransferConfig {
    /// Directory finished files are moved into
    pub output_dir: PathBuf,
    /// Per-request timeout (None = no timeout)
    pub timeout: Option<Duration>,
    pub retry: RetryConfig,
    pub user_agent: String,
}

impl HttpTransferConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            timeout: None,
            retry: RetryConfig::default(),
            user_agent: format!("dlcore/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Downloads a task's URL into the output directory.
///
/// The origin budget is charged once per request attempt, every chunk is paced
/// through the task's token bucket, and data lands in a temp file that is
/// renamed into place only after the stream ends. A paused or cancelled task
/// discards its partial file; resuming starts the transfer over.
pub struct HttpTransfer {
    client: reqwest::Client,
    retry: RetryExecutor,
    output_dir: PathBuf,
}

impl HttpTransfer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self, DlError> {
        Self::with_config(HttpTransferConfig::new(output_dir))
    }

    pub fn with_config(config: HttpTransferConfig) -> Result<Self, DlError> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            retry: RetryExecutor::with_config(config.retry),
            output_dir: config.output_dir,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Run the transfer for one task. Returns the number of bytes written.
    pub async fn fetch(&self, ctx: &TaskContext) -> Result<u64, DlError> {
        let url = parse_http_url(ctx.url())?;
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let response = self
            .retry
            .execute(|| {
                let url = url.clone();
                async move {
                    ctx.acquire_origin().await?;
                    debug!(id = %ctx.id(), %url, "Sending request");
                    let response = self.client.get(url).send().await?;
                    Ok(response.error_for_status()?)
                }
            })
            .await?;

        let filename = filename_from_url(url.as_str());
        let tmp_path = self
            .output_dir
            .join(format!(".{}.{:08x}.tmp", filename, rand::random::<u32>()));
        let mut file = File::create(&tmp_path).await?;

        match self.stream_to_file(ctx, response, &mut file).await {
            Ok(downloaded) => {
                drop(file);
                let output_path = unique_path(&self.output_dir, &filename);
                tokio::fs::rename(&tmp_path, &output_path).await?;
                info!(id = %ctx.id(), path = %output_path.display(), bytes = downloaded, "Download finished");
                Ok(downloaded)
            }
            Err(e) => {
                drop(file);
                if !matches!(e, DlError::Cancelled) {
                    warn!(id = %ctx.id(), error = %e, "Download failed, cleaning up temp file");
                }
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(e)
            }
        }
    }

    async fn stream_to_file(
        &self,
        ctx: &TaskContext,
        response: reqwest::Response,
        file: &mut File,
    ) -> Result<u64, DlError> {
        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        ctx.report_progress(0, total);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            ctx.throttle(chunk.len() as u64).await?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            ctx.report_progress(downloaded, total);
        }

        if let Some(total) = total {
            if downloaded < total {
                return Err(DlError::Transfer(format!(
                    "stream ended after {} of {} bytes",
                    downloaded, total
                )));
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(downloaded)
    }
}

#[async_trait]
impl UnitOfWork for HttpTransfer {
    async fn perform(&self, ctx: TaskContext) -> Result<u64, DlError> {
        self.fetch(&ctx).await
    }
}
