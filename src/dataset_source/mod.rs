//! Dataset source search and retrieval.
//!
//! The actual search provider is an external collaborator; this module owns
//! the seam ([`DatasetProvider`]), the candidate ranking the dataset agent
//! applies, and an HTTP implementation against a provider endpoint.

use crate::{ForgeError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One search hit from the dataset source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetCandidate {
    pub name: String,
    /// Provider-scoped reference used to fetch the archive.
    pub download_url: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub popularity: f64,
    #[serde(default)]
    pub description: String,
    /// Archive extension, e.g. `zip` or `tar.gz`.
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "zip".to_string()
}

#[async_trait]
pub trait DatasetProvider: Send + Sync {
    async fn search(&self, keywords: &[String]) -> Result<Vec<DatasetCandidate>>;
    /// Download the candidate archive to `dest_path`; returns the byte count.
    async fn fetch(&self, candidate: &DatasetCandidate, dest_path: &Path) -> Result<u64>;
}

/// Fraction of the keywords that appear in the candidate name/description.
fn keyword_coverage(candidate: &DatasetCandidate, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let haystack = format!(
        "{} {}",
        candidate.name.to_lowercase(),
        candidate.description.to_lowercase()
    );
    let hits = keywords
        .iter()
        .filter(|k| haystack.contains(k.as_str()))
        .count();
    hits as f64 / keywords.len() as f64
}

/// Drop candidates over the byte cap and order the rest: keyword coverage
/// first, popularity next, smaller archives last as the tie-break.
pub fn rank_candidates(
    mut candidates: Vec<DatasetCandidate>,
    keywords: &[String],
    max_bytes: u64,
) -> Vec<DatasetCandidate> {
    candidates.retain(|c| c.size_bytes > 0 && c.size_bytes <= max_bytes);
    candidates.sort_by(|a, b| {
        let cov_a = keyword_coverage(a, keywords);
        let cov_b = keyword_coverage(b, keywords);
        cov_b
            .partial_cmp(&cov_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.popularity
                    .partial_cmp(&a.popularity)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.size_bytes.cmp(&b.size_bytes))
    });
    candidates
}

/// Search provider spoken to over HTTP: `GET {base}/search?q=<keywords>`
/// returning a JSON array of candidates.
pub struct HttpDatasetProvider {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDatasetProvider {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(600))
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DatasetProvider for HttpDatasetProvider {
    async fn search(&self, keywords: &[String]) -> Result<Vec<DatasetCandidate>> {
        let response = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&[("q", keywords.join(" "))])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ForgeError::Dependency {
                service: "dataset_source".to_string(),
                detail: format!("search returned HTTP {status}"),
            });
        }
        Ok(response.json().await?)
    }

    async fn fetch(&self, candidate: &DatasetCandidate, dest_path: &Path) -> Result<u64> {
        let response = self.http.get(&candidate.download_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ForgeError::Dependency {
                service: "dataset_source".to_string(),
                detail: format!("fetch of {} returned HTTP {status}", candidate.name),
            });
        }

        let mut file = tokio::fs::File::create(dest_path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
            written += chunk.len() as u64;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, size_bytes: u64, popularity: f64) -> DatasetCandidate {
        DatasetCandidate {
            name: name.to_string(),
            download_url: format!("http://example/{name}"),
            size_bytes,
            popularity,
            description: String::new(),
            format: "zip".to_string(),
        }
    }

    #[test]
    fn ranking_filters_oversized_candidates() {
        let keywords = vec!["flower".to_string()];
        let ranked = rank_candidates(
            vec![
                candidate("flower photos", 2_000_000_000, 10.0),
                candidate("flower small", 400_000_000, 1.0),
            ],
            &keywords,
            500_000_000,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name, "flower small");
    }

    #[test]
    fn ranking_prefers_keyword_coverage_then_popularity_then_size() {
        let keywords = vec!["flower".to_string(), "classifier".to_string()];
        let ranked = rank_candidates(
            vec![
                candidate("random images", 100, 100.0),
                candidate("flower classifier set", 300, 1.0),
                candidate("flower pictures", 200, 50.0),
                candidate("flower pictures mirror", 100, 50.0),
            ],
            &keywords,
            1_000,
        );
        assert_eq!(ranked[0].name, "flower classifier set");
        assert_eq!(ranked[1].name, "flower pictures mirror");
        assert_eq!(ranked[2].name, "flower pictures");
        assert_eq!(ranked[3].name, "random images");
    }

    #[test]
    fn ranking_drops_empty_archives() {
        let ranked = rank_candidates(
            vec![candidate("empty", 0, 5.0)],
            &["empty".to_string()],
            1_000,
        );
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn http_provider_searches_and_fetches() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::UrlEncoded(
                "q".into(),
                "flower classifier".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"[{{"name":"flowers","download_url":"{}/dl/flowers.zip","size_bytes":12,"popularity":3.0}}]"#,
                server.url()
            ))
            .create_async()
            .await;
        server
            .mock("GET", "/dl/flowers.zip")
            .with_status(200)
            .with_body("archive-bytes")
            .create_async()
            .await;

        let provider = HttpDatasetProvider::new(&server.url()).unwrap();
        let hits = provider
            .search(&["flower".to_string(), "classifier".to_string()])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].format, "zip");

        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("flowers.zip");
        let written = provider.fetch(&hits[0], &dest).await.unwrap();
        assert_eq!(written, 13);
    }
}
