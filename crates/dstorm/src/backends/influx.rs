use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::backends::PointSink;
use crate::common::Point;

/// ⚙️ Where the points go and how to get past the bouncer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfluxSinkConfig {
    /// 📡 base URL, e.g. `http://localhost:8086`
    pub url: String,
    pub org: String,
    pub bucket: String,
    /// 🔒 API token. Optional for local setups running with auth disabled.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

/// 📡 A line-protocol writer for an InfluxDB-compatible `/api/v2/write` endpoint.
///
/// `write_points` renders and stages lines; `flush` POSTs them in one request.
/// Staging is per handle, so cloning the sink hands a worker its own clean slate
/// on top of the same pooled `reqwest::Client`.
///
/// 🔄 This sink does not retry. The consumer buffer keeps the points and tries
/// again on the next flush, which is the only retry policy anyone needs at 3am.
#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: reqwest::Url,
    token: Option<String>,
    staged: String,
    staged_points: usize,
}

impl InfluxSink {
    pub fn new(config: InfluxSinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("💀 The HTTP client refused to be born. Probably a TLS stack having a moment.")?;
        // -- 🔧 trim_end_matches('/'): one slash of difference, infinite suffering of difference
        let base = format!("{}/api/v2/write", config.url.trim_end_matches('/'));
        let write_url = reqwest::Url::parse_with_params(
            &base,
            &[
                ("org", config.org.as_str()),
                ("bucket", config.bucket.as_str()),
                ("precision", "ms"),
            ],
        )
        .with_context(|| format!("💀 '{}' is not a URL the sink can write to", config.url))?;
        Ok(Self {
            client,
            write_url,
            token: config.token,
            staged: String::new(),
            staged_points: 0,
        })
    }
}

#[async_trait]
impl PointSink for InfluxSink {
    async fn write_points(&mut self, points: &[Point]) -> Result<()> {
        for point in points {
            self.staged.push_str(&point.to_line_protocol());
            self.staged.push('\n');
        }
        self.staged_points += points.len();
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let body = std::mem::take(&mut self.staged);
        let points = std::mem::take(&mut self.staged_points);
        debug!(points, bytes = body.len(), "📡 posting line protocol");

        let mut request = self
            .client
            .post(self.write_url.clone())
            .header("Content-Type", "text/plain; charset=utf-8");
        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Token {token}"));
        }

        let response = request
            .body(body)
            .send()
            .await
            .context("💀 The write request never reached the sink. Check that it is running and reachable.")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "💀 The sink looked at {} points and said '{}'. It elaborated: '{}'",
                points,
                status,
                body
            );
        }
        trace!(points, "✅ points landed");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // 🗑️ anything still staged is flushed on the way out
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Record, Sentiment};
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn the_config(url: String) -> InfluxSinkConfig {
        InfluxSinkConfig {
            url,
            org: "acme".to_string(),
            bucket: "tweets".to_string(),
            token: Some("s3cret".to_string()),
            timeout_ms: 2000,
        }
    }

    fn the_point() -> Point {
        Point::from_record(&Record {
            id: "1".to_string(),
            timestamp_ms: 1234,
            brand: "SuperCoffee".to_string(),
            sentiment: Sentiment::Positive,
            text: "great".to_string(),
            value: 0.0,
        })
    }

    #[tokio::test]
    async fn the_one_where_points_are_posted_as_line_protocol() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/write"))
            .and(query_param("org", "acme"))
            .and(query_param("bucket", "tweets"))
            .and(query_param("precision", "ms"))
            .and(header("Authorization", "Token s3cret"))
            .and(body_string_contains("tweets,brand=SuperCoffee,sentiment=positive"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&the_server)
            .await;

        let mut the_sink = InfluxSink::new(the_config(format!("{}/", the_server.uri())))?;
        the_sink.write_points(&[the_point(), the_point()]).await?;
        the_sink.flush().await?;
        // ✅ nothing staged, so this one is free
        the_sink.flush().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_server_error_fails_the_flush_and_clears_staging() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/write"))
            .respond_with(ResponseTemplate::new(503).set_body_string("shard on vacation"))
            .expect(1)
            .mount(&the_server)
            .await;

        let mut the_sink = InfluxSink::new(the_config(the_server.uri()))?;
        the_sink.write_points(&[the_point()]).await?;
        let the_err = the_sink.flush().await.expect_err("💀 a 503 is not a success");
        assert!(the_err.to_string().contains("503"));
        // ✅ staging was dropped, so closing posts nothing and the mock's expect(1) holds
        the_sink.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_awkward_org_and_bucket_names_survive_the_trip() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/write"))
            .and(query_param("org", "acme & sons"))
            .and(query_param("bucket", "tweets/2026?raw=1"))
            .and(query_param("precision", "ms"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&the_server)
            .await;

        let mut the_config = the_config(the_server.uri());
        the_config.org = "acme & sons".to_string();
        the_config.bucket = "tweets/2026?raw=1".to_string();
        let mut the_sink = InfluxSink::new(the_config)?;
        the_sink.write_points(&[the_point()]).await?;
        the_sink.flush().await?;
        Ok(())
    }

    #[test]
    fn the_one_where_a_url_that_is_not_a_url_is_refused_up_front() {
        let the_verdict = InfluxSink::new(the_config("definitely not a url".to_string()));
        assert!(the_verdict.is_err());
    }
}
