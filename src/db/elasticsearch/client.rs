use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Method, Response, Url};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use super::connections::{ConnectionParams, SearchConnection};
use crate::error::{AppError, AppResult};

const SNIFF_PATH: &str = "_nodes/_all/http";

/// Elasticsearch HTTP transport
///
/// Holds a set of live nodes that sniffing may replace. Requests go round-robin
/// over those nodes and every request carries basic auth.
pub struct EsClient {
    http_client: HttpClient,
    nodes: RwLock<Vec<Url>>,
    cursor: AtomicUsize,
    auth: (String, String),
    sniff_timeout: Duration,
    sniff_on_node_failure: bool,
    closed: AtomicBool,
}

impl fmt::Debug for EsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EsClient")
            .field("username", &self.auth.0)
            .field("sniff_timeout", &self.sniff_timeout)
            .field("sniff_on_node_failure", &self.sniff_on_node_failure)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct NodesInfo {
    #[serde(default)]
    nodes: HashMap<String, NodeInfo>,
}

#[derive(Deserialize)]
struct NodeInfo {
    http: Option<NodeHttp>,
    #[serde(default)]
    roles: Vec<String>,
}

impl NodeInfo {
    fn is_master_only(&self) -> bool {
        matches!(self.roles.as_slice(), [role] if role == "master")
    }
}

#[derive(Deserialize)]
struct NodeHttp {
    publish_address: String,
}

impl EsClient {
    /// Builds the client without touching the network
    pub fn new(params: &ConnectionParams) -> AppResult<Self> {
        let nodes = parse_hosts(&params.hosts)?;
        let request_timeout = seconds(params.request_timeout, "request_timeout")?;
        let sniff_timeout = seconds(params.sniff_timeout, "sniff_timeout")?;

        let http_client = HttpClient::builder()
            .danger_accept_invalid_certs(!params.verify_certs)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            http_client,
            nodes: RwLock::new(nodes),
            cursor: AtomicUsize::new(0),
            auth: params.http_auth.clone(),
            sniff_timeout,
            sniff_on_node_failure: params.sniff_on_node_failure,
            closed: AtomicBool::new(false),
        })
    }

    /// Builds the client and sniffs once if `sniff_on_start` is set
    pub async fn connect(params: &ConnectionParams) -> AppResult<Self> {
        let client = Self::new(params)?;
        if params.sniff_on_start {
            client.sniff().await;
        }
        Ok(client)
    }

    /// Current live node list
    pub async fn nodes(&self) -> Vec<Url> {
        self.nodes.read().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refreshes the node list from the cluster
    ///
    /// Failures are logged and the current node list is kept.
    pub async fn sniff(&self) {
        match self.discover_nodes().await {
            Ok(discovered) if !discovered.is_empty() => {
                tracing::info!(node_count = discovered.len(), "Sniffed search nodes");
                *self.nodes.write().await = discovered;
            }
            Ok(_) => {
                tracing::warn!("Sniffing returned no usable nodes, keeping current node list");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to sniff search nodes");
            }
        }
    }

    async fn discover_nodes(&self) -> AppResult<Vec<Url>> {
        let known = self.nodes().await;
        let mut last_error = AppError::NoLiveNodes;

        for node in known {
            let response = self
                .http_client
                .get(endpoint(&node, SNIFF_PATH))
                .basic_auth(&self.auth.0, Some(&self.auth.1))
                .timeout(self.sniff_timeout)
                .send()
                .await
                .and_then(Response::error_for_status);

            let info = match response {
                Ok(response) => response.json::<NodesInfo>().await,
                Err(e) => Err(e),
            };

            match info {
                Ok(info) => return Ok(sniffed_nodes(&info, node.scheme())),
                Err(e) => {
                    tracing::debug!(node = %node, error = %e, "Sniff request failed");
                    last_error = e.into();
                }
            }
        }

        Err(last_error)
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::ConnectionClosed);
        }
        Ok(())
    }

    async fn next_node(&self) -> AppResult<Url> {
        let nodes = self.nodes.read().await;
        if nodes.is_empty() {
            return Err(AppError::NoLiveNodes);
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Ok(nodes[index].clone())
    }

    /// Sends a request to the next live node and returns the decoded JSON body
    ///
    /// A node that refuses the connection is skipped for the next one, at most
    /// once per node. A timeout is returned as-is since the node may already have
    /// applied the request. Both re-sniff first when `sniff_on_node_failure` is set.
    pub async fn perform_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> AppResult<Value> {
        self.ensure_open()?;

        let attempts = self.nodes.read().await.len().max(1);
        let mut last_error = AppError::NoLiveNodes;

        for _ in 0..attempts {
            let node = self.next_node().await?;
            let mut request = self
                .http_client
                .request(method.clone(), endpoint(&node, path))
                .basic_auth(&self.auth.0, Some(&self.auth.1));
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => return read_response(response).await,
                Err(e) if e.is_connect() => {
                    tracing::warn!(node = %node, error = %e, "Search node unreachable");
                    last_error = e.into();
                    if self.sniff_on_node_failure {
                        self.sniff().await;
                    }
                }
                Err(e) if e.is_timeout() => {
                    tracing::warn!(node = %node, error = %e, "Search request timed out");
                    if self.sniff_on_node_failure {
                        self.sniff().await;
                    }
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error)
    }

    /// Returns true if the cluster answers `HEAD /`
    pub async fn ping(&self) -> bool {
        self.perform_request(Method::HEAD, "/", None).await.is_ok()
    }
}

#[async_trait]
impl SearchConnection for EsClient {
    async fn close(&self) -> AppResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Search client closed");
        }
        Ok(())
    }
}

async fn read_response(response: Response) -> AppResult<Value> {
    let status = response.status();
    if !status.is_success() {
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(
                    status = status.as_u16(),
                    error = %e,
                    "Failed to read error body"
                );
                String::new()
            }
        };
        return Err(AppError::SearchApi {
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Node URLs from a sniff response, sorted, without master-only nodes
fn sniffed_nodes(info: &NodesInfo, scheme: &str) -> Vec<Url> {
    let mut discovered: Vec<Url> = info
        .nodes
        .values()
        .filter(|n| !n.is_master_only())
        .filter_map(|n| n.http.as_ref())
        .filter_map(|h| parse_publish_address(&h.publish_address, scheme))
        .collect();
    discovered.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    discovered.dedup();
    discovered
}

fn endpoint(node: &Url, path: &str) -> String {
    format!(
        "{}/{}",
        node.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn seconds(value: f64, name: &str) -> AppResult<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        AppError::InvalidConfig(format!(
            "{} must be a non-negative number of seconds",
            name
        ))
    })
}

/// Parses a comma-separated host list, defaulting to `http://` when no scheme is given
pub fn parse_hosts(hosts: &str) -> AppResult<Vec<Url>> {
    let nodes = hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(|h| {
            let candidate = if h.contains("://") {
                h.to_string()
            } else {
                format!("http://{}", h)
            };
            Url::parse(&candidate).map_err(|e| AppError::InvalidUrl(format!("{}: {}", h, e)))
        })
        .collect::<AppResult<Vec<_>>>()?;

    if nodes.is_empty() {
        return Err(AppError::InvalidUrl("no search hosts given".to_string()));
    }
    Ok(nodes)
}

/// Turns a sniffed `publish_address` into a node URL
///
/// Accepts `host:port` and `hostname/ip:port`; the latter keeps the hostname.
pub fn parse_publish_address(address: &str, scheme: &str) -> Option<Url> {
    let (host, port) = match address.split_once('/') {
        Some((hostname, ip_and_port)) => {
            let (_, port) = ip_and_port.rsplit_once(':')?;
            (hostname, port)
        }
        None => address.rsplit_once(':')?,
    };

    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Url::parse(&format!("{}://{}:{}", scheme, host, port)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn params(hosts: &str) -> ConnectionParams {
        ConnectionParams {
            hosts: hosts.to_string(),
            verify_certs: false,
            request_timeout: 0.5,
            sniff_on_start: false,
            sniff_timeout: 0.5,
            sniff_on_node_failure: false,
            http_auth: ("elastic".to_string(), "changeme".to_string()),
        }
    }

    #[test]
    fn test_parse_hosts_adds_default_scheme() {
        let nodes = parse_hosts("localhost:9200").unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].as_str(), "http://localhost:9200/");
    }

    #[test]
    fn test_parse_hosts_multiple_seeds() {
        let nodes = parse_hosts("https://es-1:9200, es-2:9200 ,").unwrap();
        let rendered: Vec<&str> = nodes.iter().map(Url::as_str).collect();
        assert_eq!(rendered, vec!["https://es-1:9200/", "http://es-2:9200/"]);
    }

    #[test]
    fn test_parse_hosts_rejects_empty() {
        let err = assert_err!(parse_hosts(" , "));
        assert!(matches!(err, AppError::InvalidUrl(_)));
    }

    #[test]
    fn test_parse_publish_address_plain() {
        let url = parse_publish_address("10.0.0.1:9200", "http").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:9200/");
    }

    #[test]
    fn test_parse_publish_address_keeps_hostname() {
        let url = parse_publish_address("es-node-2/10.0.0.2:9201", "https").unwrap();
        assert_eq!(url.as_str(), "https://es-node-2:9201/");
    }

    #[test]
    fn test_parse_publish_address_invalid() {
        assert!(parse_publish_address("no-port", "http").is_none());
        assert!(parse_publish_address("host:notaport", "http").is_none());
        assert!(parse_publish_address(":9200", "http").is_none());
    }

    #[test]
    fn test_sniffed_nodes_skip_master_only() {
        let info: NodesInfo = serde_json::from_value(serde_json::json!({
            "nodes": {
                "m": { "roles": ["master"], "http": { "publish_address": "master-1:9200" } },
                "d": { "roles": ["data", "ingest"], "http": { "publish_address": "data-1:9200" } },
                "md": { "roles": ["master", "data"], "http": { "publish_address": "data-2:9200" } },
                "legacy": { "http": { "publish_address": "old-1:9200" } }
            }
        }))
        .unwrap();

        let rendered: Vec<String> = sniffed_nodes(&info, "http")
            .iter()
            .map(|u| u.as_str().to_string())
            .collect();
        assert_eq!(
            rendered,
            vec![
                "http://data-1:9200/",
                "http://data-2:9200/",
                "http://old-1:9200/"
            ]
        );
    }

    #[test]
    fn test_endpoint_joins_paths() {
        let node = Url::parse("http://localhost:9200").unwrap();
        assert_eq!(
            endpoint(&node, "/_cluster/health"),
            "http://localhost:9200/_cluster/health"
        );
        assert_eq!(
            endpoint(&node, "_nodes/_all/http"),
            "http://localhost:9200/_nodes/_all/http"
        );
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let mut p = params("localhost:9200");
        p.request_timeout = -1.0;
        let err = assert_err!(EsClient::new(&p));
        assert!(matches!(err, AppError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_round_robin_over_seeds() {
        let client = EsClient::new(&params("es-1:9200,es-2:9200")).unwrap();

        let first = client.next_node().await.unwrap();
        let second = client.next_node().await.unwrap();
        let third = client.next_node().await.unwrap();

        assert_eq!(first.as_str(), "http://es-1:9200/");
        assert_eq!(second.as_str(), "http://es-2:9200/");
        assert_eq!(third, first);
    }

    #[tokio::test]
    async fn test_closed_client_refuses_requests() {
        let client = EsClient::new(&params("localhost:9200")).unwrap();

        assert_ok!(client.close().await);
        assert!(client.is_closed());

        let err = assert_err!(client.perform_request(Method::GET, "/", None).await);
        assert!(matches!(err, AppError::ConnectionClosed));
        assert!(!client.ping().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = EsClient::new(&params("localhost:9200")).unwrap();
        assert_ok!(client.close().await);
        assert_ok!(client.close().await);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_connect_without_sniff_keeps_seeds() {
        let client = EsClient::connect(&params("unreachable.invalid:9200"))
            .await
            .unwrap();
        let nodes = client.nodes().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].as_str(), "http://unreachable.invalid:9200/");
    }
}
