use std::time::Duration;

use anyhow::{Context, anyhow};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::settings::CatalogEndpoint;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin JSON client for the `/api/...` surface both catalog services share.
#[derive(Clone)]
pub(super) struct ApiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    pub(super) fn new(endpoint: &CatalogEndpoint) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            api_key: endpoint.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }

    pub(super) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<T> {
        self.get_optional(path, query)
            .await?
            .ok_or_else(|| anyhow!("{} returned 404", self.url(path)))
    }

    /// A 404 is `Ok(None)`; any other non-success status is an error.
    pub(super) async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<Option<T>> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .query(&[("apikey", &self.api_key)])
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response
            .error_for_status()
            .with_context(|| format!("GET {url} was rejected"))?
            .json()
            .await
            .with_context(|| format!("GET {url} returned an unexpected body"))?;
        Ok(Some(body))
    }

    pub(super) async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        let url = self.url(path);
        self.client
            .post(&url)
            .query(&[("apikey", &self.api_key)])
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?
            .error_for_status()
            .with_context(|| format!("POST {url} was rejected"))?
            .json()
            .await
            .with_context(|| format!("POST {url} returned an unexpected body"))
    }
}

#[cfg(test)]
pub(super) mod testing {
    use axum::Router;
    use tokio::net::TcpListener;

    use crate::config::settings::CatalogEndpoint;

    pub(crate) const API_KEY: &str = "secret";

    /// Serve `router` on an ephemeral port and point an endpoint at it.
    pub(crate) async fn serve(router: Router) -> CatalogEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        CatalogEndpoint {
            base_url: format!("http://{addr}/"),
            api_key: API_KEY.to_string(),
        }
    }
}
