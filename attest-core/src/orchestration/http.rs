//! JSON-over-HTTP clients for the catalog, the connection directory and the
//! query engine.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use attest_model::{Benchmark, Connection, QueryDefinition, QueryOutput, Policy, RunnerJob};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

use super::catalog::{ConnectionDirectory, QueryCatalog, QueryEngine};
use crate::error::{ComplianceError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct JsonClient {
    http: reqwest::Client,
    base: Url,
}

impl fmt::Debug for JsonClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonClient")
            .field("base", &self.base.as_str())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl JsonClient {
    fn new(base: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base)
            .map_err(|err| ComplianceError::InvalidInput(format!("invalid base url {base}: {err}")))?;
        // Url::join drops the last segment unless the path ends in a slash.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| ComplianceError::InvalidInput(format!("invalid path {path}: {err}")))
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<Option<T>> {
        let status = response.status();
        if status.is_success() {
            return Ok(Some(response.json::<T>().await?));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| format!("request failed with status {status}"));
        Err(ComplianceError::Execution(message))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self.http.get(self.endpoint(path)?).send().await?;
        Self::read(response).await
    }

    async fn post<B: Serialize + ?Sized + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>> {
        let response = self.http.post(self.endpoint(path)?).json(body).send().await?;
        Self::read(response).await
    }
}

/// Catalog served under `{base}/queries`, `{base}/benchmarks` and
/// `{base}/policies`.
#[derive(Clone, Debug)]
pub struct HttpQueryCatalog {
    client: JsonClient,
}

impl HttpQueryCatalog {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: JsonClient::new(base_url, DEFAULT_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl QueryCatalog for HttpQueryCatalog {
    async fn get_query(&self, id: &str) -> Result<Option<QueryDefinition>> {
        self.client.get(&format!("queries/{id}")).await
    }

    async fn list_queries(&self) -> Result<Vec<QueryDefinition>> {
        Ok(self.client.get("queries").await?.unwrap_or_default())
    }

    async fn get_benchmark(&self, id: &str) -> Result<Option<Benchmark>> {
        self.client.get(&format!("benchmarks/{id}")).await
    }

    async fn get_policy(&self, id: &str) -> Result<Option<Policy>> {
        self.client.get(&format!("policies/{id}")).await
    }
}

#[derive(Clone, Debug)]
pub struct HttpConnectionDirectory {
    client: JsonClient,
}

impl HttpConnectionDirectory {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: JsonClient::new(base_url, DEFAULT_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl ConnectionDirectory for HttpConnectionDirectory {
    async fn list_connections(&self) -> Result<Vec<Connection>> {
        Ok(self.client.get("connections").await?.unwrap_or_default())
    }
}

/// Posts the runner job to `{base}/run` and reads back the result set.
#[derive(Clone, Debug)]
pub struct HttpQueryEngine {
    client: JsonClient,
}

impl HttpQueryEngine {
    /// The worker enforces its own deadline; `timeout` is a transport bound.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: JsonClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl QueryEngine for HttpQueryEngine {
    async fn execute(&self, job: &RunnerJob) -> Result<QueryOutput> {
        self.client.post("run", job).await?.ok_or_else(|| {
            ComplianceError::Execution(format!("engine has no handler for query {}", job.query.id))
        })
    }
}
