use crate::conf::ServerAddr;
use anyhow::bail;
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;

/// Request header carrying the store ACL token
pub(crate) const TOKEN_HEADER: &str = "X-Consul-Token";

/// Thin wrapper over a reqwest client bound to one store.
///
/// Transport errors and non-success statuses are returned as-is, the
/// backend maps them onto its own error taxonomy.
#[derive(Debug, Clone)]
pub(crate) struct Network {
    client: reqwest::Client,
    token: Option<String>,
}

/// A response that was read completely.
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: String,
}

impl Network {
    /// `read_timeout` must exceed the longest blocking query wait window.
    pub(crate) fn new(
        connect_timeout: Duration,
        read_timeout: Duration,
        token: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::ClientBuilder::default()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Network { client, token })
    }

    pub(crate) async fn get(
        &self,
        url: &str,
        query: impl Serialize + Debug,
    ) -> reqwest::Result<RawResponse> {
        log::debug!("GET {}, query: {:?}", url, query);
        let mut request = self.client.get(url).query(&query);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        Self::read(request.send().await?).await
    }

    pub(crate) async fn put(
        &self,
        url: &str,
        body: Option<impl Serialize + Debug>,
    ) -> reqwest::Result<RawResponse> {
        log::debug!("PUT {}, body: {:?}", url, body);
        let mut request = self.client.put(url);
        if let Some(body) = &body {
            request = request.json(body);
        }
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        Self::read(request.send().await?).await
    }

    /// Raw body write, used for key/value puts.
    pub(crate) async fn put_bytes(&self, url: &str, body: Vec<u8>) -> reqwest::Result<RawResponse> {
        log::debug!("PUT {}, {} bytes", url, body.len());
        let mut request = self.client.put(url).body(body);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        Self::read(request.send().await?).await
    }

    async fn read(response: Response) -> reqwest::Result<RawResponse> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

impl RawResponse {
    pub(crate) fn header_u64(&self, name: &str) -> Option<u64> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub(crate) fn header_bool(&self, name: &str) -> Option<bool> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<bool>().ok())
    }
}

impl ServerAddr {
    pub fn build_url(&self, path: &str) -> anyhow::Result<String> {
        match self {
            ServerAddr::Single(address) => Ok(Self::join(address, path)),
            ServerAddr::Cluster(addresses) => {
                if addresses.is_empty() {
                    bail!("registry server address list is empty");
                }
                let address = &addresses[fastrand::usize(..addresses.len())];
                Ok(Self::join(address, path))
            }
            ServerAddr::Unset => {
                bail!("registry server address not set");
            }
        }
    }

    fn join(address: &str, path: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}{}", address.trim_end_matches('/'), path)
        } else {
            format!("http://{}{}", address, path)
        }
    }
}
