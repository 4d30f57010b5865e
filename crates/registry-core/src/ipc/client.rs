//! Client for the registry endpoint.
//!
//! Every call opens a fresh connection, sends one request line, reads one
//! response line and closes. Error responses are turned back into the
//! matching `RegistryError` variant.

use super::protocol::{
    methods, read_frame, write_frame, GrantedReservation, InstanceSummary, IpcRequest,
    IpcResponse, QueryParams, QueryResult, RegisterParams, UnregisterParams,
};
use crate::config::{self, RegistryConfig};
use crate::registry::ReservationToken;
use crate::{RegistryError, Result};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of `RegistryClient::acquire`.
#[derive(Debug, Clone, PartialEq)]
pub enum Acquired {
    /// An instance is already running at this address.
    Existing(InstanceSummary),
    /// The caller holds the reservation and must launch, then register.
    Claimed(GrantedReservation),
}

/// Client for one registry endpoint.
#[derive(Debug)]
pub struct RegistryClient {
    addr: SocketAddr,
    next_id: AtomicU64,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new(config::default_endpoint())
    }
}

impl RegistryClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            next_id: AtomicU64::new(1),
            connect_timeout: RegistryConfig::IPC_CONNECT_TIMEOUT,
            request_timeout: RegistryConfig::IPC_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether something accepts connections on the endpoint.
    pub async fn is_reachable(&self) -> bool {
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr)).await,
            Ok(Ok(_))
        )
    }

    async fn connect(&self) -> Result<TcpStream> {
        let unreachable = || RegistryError::DaemonUnreachable {
            addr: self.addr.to_string(),
        };
        tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| unreachable())?
            .map_err(|_| unreachable())
    }

    /// Call a method and return its raw result.
    ///
    /// An error response is mapped through `RegistryError::from_rpc`, using
    /// the `identifier` param to fill in variants that carry one.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let identifier = params
            .get("identifier")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let request_bytes = serde_json::to_vec(&IpcRequest::new(method, params, id))?;

        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let exchange = async {
            write_frame(&mut writer, &request_bytes).await?;
            read_frame(&mut reader).await
        };
        let response_bytes = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| RegistryError::Timeout(self.request_timeout))??
            .ok_or_else(|| RegistryError::Io {
                message: format!("{} closed the connection without a response", self.addr),
                source: None,
            })?;

        let response: IpcResponse =
            serde_json::from_slice(&response_bytes).map_err(|e| RegistryError::Json {
                message: format!("Failed to parse IPC response: {}", e),
                source: Some(e),
            })?;

        if let Some(err) = response.error {
            debug!("{} failed with {}: {}", method, err.code, err.message);
            return Err(RegistryError::from_rpc(err.code, err.message, &identifier));
        }

        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl serde::Serialize,
    ) -> Result<T> {
        let result = self.call(method, serde_json::to_value(params)?).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Look up an Active instance without reserving.
    ///
    /// Fails with `ReservationPending` while another caller holds a claim.
    pub async fn query(&self, identifier: &str) -> Result<Option<InstanceSummary>> {
        let params = QueryParams {
            identifier: identifier.to_string(),
            reserve: false,
        };
        match self
            .call_typed::<Option<QueryResult>>(methods::QUERY_INSTANCE, params)
            .await?
        {
            None => Ok(None),
            Some(QueryResult::Active(instance)) => Ok(Some(instance)),
            Some(QueryResult::Reserved(_)) => Err(RegistryError::Internal(
                "Plain query returned a reservation".to_string(),
            )),
        }
    }

    /// Find the instance or reserve the identifier in one step.
    pub async fn find_or_claim(&self, identifier: &str) -> Result<QueryResult> {
        let params = QueryParams {
            identifier: identifier.to_string(),
            reserve: true,
        };
        self.call_typed::<Option<QueryResult>>(methods::QUERY_INSTANCE, params)
            .await?
            .ok_or_else(|| RegistryError::Internal("Claim query returned null".to_string()))
    }

    /// Poll `find_or_claim` until an instance is found or a claim is won.
    ///
    /// Gives up with `Timeout` once `wait` has elapsed while the identifier
    /// stays reserved by someone else.
    pub async fn acquire(&self, identifier: &str, poll: Duration, wait: Duration) -> Result<Acquired> {
        let deadline = Instant::now() + wait;
        loop {
            match self.find_or_claim(identifier).await {
                Ok(QueryResult::Active(instance)) => return Ok(Acquired::Existing(instance)),
                Ok(QueryResult::Reserved(reservation)) => return Ok(Acquired::Claimed(reservation)),
                Err(e) if e.is_retryable() => {
                    if Instant::now() + poll > deadline {
                        return Err(RegistryError::Timeout(wait));
                    }
                    debug!("{} is being launched elsewhere, polling", identifier);
                    tokio::time::sleep(poll).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<InstanceSummary>> {
        self.call_typed(methods::LIST_INSTANCES, serde_json::json!({}))
            .await
    }

    /// Register `server_address`, promoting `token` when one is held.
    pub async fn register(
        &self,
        identifier: &str,
        server_address: &str,
        token: Option<&ReservationToken>,
    ) -> Result<()> {
        let params = RegisterParams {
            identifier: identifier.to_string(),
            server_address: server_address.to_string(),
            reservation_token: token.cloned(),
        };
        self.call(methods::REGISTER_INSTANCE, serde_json::to_value(params)?)
            .await?;
        Ok(())
    }

    pub async fn unregister(&self, identifier: &str) -> Result<()> {
        let params = UnregisterParams {
            identifier: identifier.to_string(),
            reservation_token: None,
        };
        self.call(methods::UNREGISTER_INSTANCE, serde_json::to_value(params)?)
            .await?;
        Ok(())
    }

    /// Give up a held reservation without registering.
    pub async fn release(&self, identifier: &str, token: &ReservationToken) -> Result<()> {
        let params = UnregisterParams {
            identifier: identifier.to_string(),
            reservation_token: Some(token.clone()),
        };
        self.call(methods::UNREGISTER_INSTANCE, serde_json::to_value(params)?)
            .await?;
        Ok(())
    }

    /// Ask the daemon to stop.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(methods::SHUTDOWN, serde_json::json!({})).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dead_endpoint_is_unreachable() {
        // Nothing listens on port 1.
        let client = RegistryClient::new("127.0.0.1:1".parse().unwrap());
        assert!(!client.is_reachable().await);

        match client.list().await.unwrap_err() {
            RegistryError::DaemonUnreachable { addr } => assert_eq!(addr, "127.0.0.1:1"),
            other => panic!("Expected DaemonUnreachable, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = RegistryClient::new(listener.local_addr().unwrap())
            .with_request_timeout(Duration::from_millis(100));

        let _held = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let err = client.list().await.unwrap_err();
        assert!(matches!(err, RegistryError::Timeout(_)));
    }
}
