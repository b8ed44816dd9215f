use super::{BlobDiscoveryResponse, BlobTransferClient, PeerDiscovery, TransferManifest};
use crate::error::{Result, TesseraError};
use crate::meta::PartitionKey;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tracing::debug;

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|error| TesseraError::Http(error.to_string()))
}

/// Appends percent-encoded path segments to a peer base URL.
fn peer_url(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url =
        Url::parse(base).map_err(|error| TesseraError::Http(format!("{}: {}", base, error)))?;
    url.path_segments_mut()
        .map_err(|_| TesseraError::Http(format!("{} cannot be a base url", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Talks to the transfer session endpoints of peers over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBlobTransferClient {
    client: Client,
}

impl HttpBlobTransferClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(request_timeout)?,
        })
    }
}

#[async_trait]
impl BlobTransferClient for HttpBlobTransferClient {
    async fn open_session(
        &self,
        peer_url: &str,
        partition: &PartitionKey,
    ) -> Result<TransferManifest> {
        let version = partition.version().to_string();
        let index = partition.partition.to_string();
        let url = peer_url_for_partition(peer_url, partition.store(), &version, &index)?;

        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|error| TesseraError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(TesseraError::Http(format!(
                "open session for {} on {} failed: status={}",
                partition,
                peer_url,
                response.status()
            )));
        }

        response
            .json::<TransferManifest>()
            .await
            .map_err(|error| TesseraError::Http(error.to_string()))
    }

    async fn fetch_file(&self, peer_url: &str, session_id: &str, name: &str) -> Result<Bytes> {
        let url = peer_url_for_session(peer_url, session_id, &["files", name])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| TesseraError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(TesseraError::Http(format!(
                "fetch {} of session {} from {} failed: status={}",
                name,
                session_id,
                peer_url,
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|error| TesseraError::Http(error.to_string()))
    }

    async fn close_session(&self, peer_url: &str, session_id: &str) -> Result<()> {
        let url = peer_url_for_session(peer_url, session_id, &[])?;
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|error| TesseraError::Http(error.to_string()))?;

        // Expired sessions are already gone on the source.
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(TesseraError::Http(format!(
            "close session {} on {} failed: status={}",
            session_id,
            peer_url,
            response.status()
        )))
    }
}

fn peer_url_for_partition(base: &str, store: &str, version: &str, partition: &str) -> Result<Url> {
    peer_url(
        base,
        &["internal", "v1", "transfer", store, version, partition, "sessions"],
    )
}

fn peer_url_for_session(base: &str, session_id: &str, rest: &[&str]) -> Result<Url> {
    let mut segments = vec!["internal", "v1", "transfer", "sessions", session_id];
    segments.extend_from_slice(rest);
    peer_url(base, &segments)
}

/// Asks every configured peer's discovery endpoint which nodes hold a READY
/// copy and merges the answers in peer order.
#[derive(Debug, Clone)]
pub struct HttpPeerDiscovery {
    peers: Vec<String>,
    client: Client,
}

impl HttpPeerDiscovery {
    pub fn new(peers: Vec<String>, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            peers,
            client: build_client(request_timeout)?,
        })
    }

    async fn ask(&self, peer: &str, partition: &PartitionKey) -> Result<Vec<String>> {
        let version = partition.version().to_string();
        let index = partition.partition.to_string();
        let url = peer_url(
            peer,
            &["blob_discovery", partition.store(), &version, &index],
        )?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| TesseraError::Http(error.to_string()))?;
        if !response.status().is_success() {
            return Err(TesseraError::Http(format!(
                "discovery on {} failed: status={}",
                peer,
                response.status()
            )));
        }

        let body: BlobDiscoveryResponse = response
            .json()
            .await
            .map_err(|error| TesseraError::Http(error.to_string()))?;
        if body.is_error {
            return Err(TesseraError::Http(format!(
                "discovery on {} failed: {}",
                peer,
                body.message.unwrap_or_default()
            )));
        }
        Ok(body.available_nodes)
    }
}

#[async_trait]
impl PeerDiscovery for HttpPeerDiscovery {
    async fn discover(&self, partition: &PartitionKey) -> Result<Vec<String>> {
        let answers = join_all(self.peers.iter().map(|peer| self.ask(peer, partition))).await;

        let mut nodes: Vec<String> = Vec::new();
        let mut failures = 0;
        for (peer, answer) in self.peers.iter().zip(answers) {
            match answer {
                Ok(available) => {
                    for node in available {
                        if !nodes.contains(&node) {
                            nodes.push(node);
                        }
                    }
                }
                Err(e) => {
                    debug!("Peer {} did not answer discovery for {}: {}", peer, partition, e);
                    failures += 1;
                }
            }
        }

        if failures > 0 && failures == self.peers.len() {
            return Err(TesseraError::Http(format!(
                "no peer answered discovery for {}",
                partition
            )));
        }
        Ok(nodes)
    }
}
