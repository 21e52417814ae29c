use crate::config::{PublishConfig, PublishType};
use crate::error::WorkerError;
use crate::job::path_component;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where logs and result indexes end up. Returns a public URL per file.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn push_file(&self, job_unique: &str, path: &Path) -> Result<String, WorkerError>;
}

/// Copies artifacts into `<path>/<job unique>/` and serves them under
/// `<prepend_url><job unique>/`. The job unique is encoded as a single path
/// component, so whatever the queue sends stays under `<path>`.
pub struct LocalArtifactStore {
    root: PathBuf,
    prepend_url: String,
}

impl LocalArtifactStore {
    pub fn new(root: PathBuf, prepend_url: String) -> Self {
        Self { root, prepend_url }
    }
}

#[async_trait::async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn push_file(&self, job_unique: &str, path: &Path) -> Result<String, WorkerError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| WorkerError::Publish(format!("{} has no file name", path.display())))?
            .to_string_lossy()
            .into_owned();
        let job_dir = path_component(job_unique);
        let dest_dir = self.root.join(&job_dir);
        tokio::fs::create_dir_all(&dest_dir).await.map_err(|e| {
            WorkerError::Publish(format!("cannot create {}: {}", dest_dir.display(), e))
        })?;
        tokio::fs::copy(path, dest_dir.join(&file_name)).await.map_err(|e| {
            WorkerError::Publish(format!("cannot copy {}: {}", path.display(), e))
        })?;

        // The directory name is served literally, so its own escapes are escaped.
        let url = format!(
            "{}{}/{}",
            self.prepend_url,
            job_dir.replace('%', "%25"),
            file_name
        );
        debug!("Published {} to {}", path.display(), url);
        Ok(url)
    }
}

/// Build the artifact store described by the `publish_logs` section.
pub fn store_from_config(config: &PublishConfig) -> Box<dyn ArtifactStore> {
    match config.publish_type {
        PublishType::Local => Box::new(LocalArtifactStore::new(
            config.path.clone(),
            config.prepend_url.clone(),
        )),
    }
}

/// One log in a result index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedLog {
    pub name: String,
    pub log_path: PathBuf,
    pub result: String,
    pub url: Option<String>,
}

/// Uploads each log and an HTML index of them; returns the index URL.
///
/// A log that fails to upload is listed without a link. Only a failure to
/// write or upload the index itself is returned as an error.
pub async fn publish_results(
    store: &dyn ArtifactStore,
    job_unique: &str,
    index_dir: &Path,
    logs: &mut [PublishedLog],
) -> Result<String, WorkerError> {
    for log in logs.iter_mut() {
        match store.push_file(job_unique, &log.log_path).await {
            Ok(url) => log.url = Some(url),
            Err(e) => warn!("Could not publish log for {}: {}", log.name, e),
        }
    }

    tokio::fs::create_dir_all(index_dir).await.map_err(|e| {
        WorkerError::Publish(format!("cannot create {}: {}", index_dir.display(), e))
    })?;
    let index_path = index_dir.join("index.html");
    tokio::fs::write(&index_path, generate_log_index(logs))
        .await
        .map_err(|e| WorkerError::Publish(format!("cannot write index: {}", e)))?;

    let url = store.push_file(job_unique, &index_path).await?;
    info!("Results index at {}", url);
    Ok(url)
}

/// HTML listing each log with a link and its result.
pub fn generate_log_index(logs: &[PublishedLog]) -> String {
    let mut output = String::from("<html><head><title>Index of results</title></head><body>");
    output.push_str(&format!(
        "<p>Generated {}</p>",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    ));
    output.push_str("<ul>");
    for log in logs {
        output.push_str("<li>");
        match &log.url {
            Some(url) => output.push_str(&format!(
                "<a href=\"{}\">{}</a>",
                escape_html(url),
                escape_html(&log.name)
            )),
            None => output.push_str(&escape_html(&log.name)),
        }
        let result = escape_html(&log.result);
        output.push_str(&format!(" <span class=\"{}\">{}</span>", result, result));
        output.push_str("</li>");
    }
    output.push_str("</ul></body></html>");
    output
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
