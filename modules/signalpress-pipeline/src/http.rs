use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use signalpress_common::{AnalysisOutput, Article, NewsletterKind, Usd};

use crate::traits::{Analysis, Analyzer, Composer, Draft, SelectedItem, Synthesis};

/// JSON client for the analysis service. Shared by both adapters.
#[derive(Clone)]
struct ServiceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ServiceClient {
    fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(%url, "Analysis service request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("analysis service error ({status}): {error_text}"));
        }

        Ok(response.json().await?)
    }
}

// ---------------------------------------------------------------------------
// HttpAnalyzer
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    id: i64,
    title: &'a str,
    url: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    #[serde(flatten)]
    output: AnalysisOutput,
    cost_usd: f64,
}

pub struct HttpAnalyzer {
    client: ServiceClient,
}

impl HttpAnalyzer {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: ServiceClient::new(base_url, api_key, timeout)?,
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, article: &Article) -> Result<Analysis> {
        let request = AnalyzeRequest {
            id: article.id,
            title: &article.title,
            url: &article.url,
            content: &article.content,
        };
        let response: AnalyzeResponse = self.client.post("analyze", &request).await?;
        Ok(Analysis {
            output: response.output,
            cost: Usd::from_dollars(response.cost_usd),
        })
    }
}

// ---------------------------------------------------------------------------
// HttpComposer
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    items: &'a [SelectedItem],
}

#[derive(Serialize)]
struct WriteRequest<'a> {
    kind: NewsletterKind,
    synthesis: &'a Synthesis,
    items: &'a [SelectedItem],
}

pub struct HttpComposer {
    client: ServiceClient,
}

impl HttpComposer {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: ServiceClient::new(base_url, api_key, timeout)?,
        })
    }
}

#[async_trait]
impl Composer for HttpComposer {
    async fn synthesize(&self, items: &[SelectedItem]) -> Result<Synthesis> {
        self.client
            .post("synthesize", &SynthesizeRequest { items })
            .await
    }

    async fn write(
        &self,
        kind: NewsletterKind,
        synthesis: &Synthesis,
        items: &[SelectedItem],
    ) -> Result<Draft> {
        self.client
            .post(
                "write",
                &WriteRequest {
                    kind,
                    synthesis,
                    items,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_response_flattens_output_fields() {
        let raw = r#"{
            "summary": "City council votes on zoning",
            "signal_strength": 0.8,
            "confidence": 0.9,
            "themes": ["housing"],
            "cost_usd": 0.0013
        }"#;
        let parsed: AnalyzeResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.output.themes, vec!["housing".to_string()]);
        assert!(parsed.output.signals.is_empty());
        assert_eq!(Usd::from_dollars(parsed.cost_usd).micros(), 1300);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client =
            ServiceClient::new("https://analysis.local/", "key", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, "https://analysis.local");
    }
}
