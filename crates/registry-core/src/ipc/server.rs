//! TCP endpoint of the registry daemon.
//!
//! Binds `127.0.0.1:<port>`, spawns one task per connection and dispatches
//! each request line to an `IpcDispatch`. A connection that sends nothing for
//! the idle timeout is closed. Shutdown stops the accept loop, closes idle
//! connections and waits for in-flight requests to be answered.
//!
//! # Request isolation
//!
//! A request that cannot be decoded gets a JSON-RPC error on its own
//! connection. A handler that panics is reported as an internal error. In
//! neither case are other connections affected.

use super::protocol::{read_frame, write_frame, IpcRequest, IpcResponse};
use crate::config::RegistryConfig;
use crate::error::codes;
use crate::shutdown::{ShutdownListener, ShutdownSignal};
use crate::{RegistryError, Result};
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Handle to a running endpoint. Dropping it shuts the endpoint down.
pub struct IpcServerHandle {
    addr: SocketAddr,
    shutdown: ShutdownSignal,
    task: Option<JoinHandle<()>>,
}

impl IpcServerHandle {
    /// Address actually bound, useful when port 0 was requested.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and close idle connections.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wait until the accept loop has stopped and every connection is drained.
    pub async fn join(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| RegistryError::Internal(format!("IPC server task failed: {}", e))),
            None => Ok(()),
        }
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.shutdown.trigger();
            task.abort();
        }
    }
}

/// Dispatches decoded method calls.
#[async_trait::async_trait]
pub trait IpcDispatch: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value>;
}

/// The registry endpoint.
pub struct IpcServer;

impl IpcServer {
    /// Bind `addr` and start serving in a background task.
    ///
    /// Binding happens before this returns, so a port conflict is reported
    /// to the caller. Triggering `shutdown` stops the server.
    pub async fn bind<D: IpcDispatch>(
        addr: SocketAddr,
        dispatch: Arc<D>,
        shutdown: ShutdownSignal,
    ) -> Result<IpcServerHandle> {
        Self::bind_with_idle_timeout(addr, dispatch, shutdown, RegistryConfig::IPC_IDLE_TIMEOUT)
            .await
    }

    /// Like [`IpcServer::bind`], closing connections that stay silent for `idle_timeout`.
    pub async fn bind_with_idle_timeout<D: IpcDispatch>(
        addr: SocketAddr,
        dispatch: Arc<D>,
        shutdown: ShutdownSignal,
        idle_timeout: Duration,
    ) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind(addr).await.map_err(|e| RegistryError::Io {
            message: format!("Failed to bind {}: {}", addr, e),
            source: Some(e),
        })?;
        let addr = listener.local_addr()?;

        info!("IPC server listening on {}", addr);

        let task = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            shutdown.clone(),
            idle_timeout,
        ));

        Ok(IpcServerHandle {
            addr,
            shutdown,
            task: Some(task),
        })
    }

    async fn accept_loop<D: IpcDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        shutdown: ShutdownSignal,
        idle_timeout: Duration,
    ) {
        let mut stop = shutdown.subscribe();
        let active_connections = Arc::new(AtomicUsize::new(0));
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = stop.wait() => {
                    info!("IPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= RegistryConfig::MAX_IPC_CONNECTIONS {
                                warn!(
                                    "Rejecting IPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    RegistryConfig::MAX_IPC_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let conns = active_connections.clone();
                            let conn_shutdown = shutdown.subscribe();

                            connections.spawn(async move {
                                debug!("IPC connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, &*dispatch, conn_shutdown, idle_timeout).await {
                                    debug!("IPC connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {}", e);
                        }
                    }
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        warn!("IPC connection task failed: {}", e);
                    }
                }
            }
        }

        // Refuse new connections while the remaining ones drain.
        drop(listener);

        let in_flight = connections.len();
        if in_flight > 0 {
            debug!("Draining {} IPC connections", in_flight);
        }
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                warn!("IPC connection task failed: {}", e);
            }
        }
        info!("IPC server stopped");
    }

    async fn handle_connection<D: IpcDispatch>(
        stream: TcpStream,
        dispatch: &D,
        mut shutdown: ShutdownListener,
        idle_timeout: Duration,
    ) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        loop {
            // Idle connections close on shutdown; a request already read is
            // always answered.
            let frame = tokio::select! {
                result = tokio::time::timeout(idle_timeout, read_frame(&mut reader)) => {
                    match result {
                        Err(_) => {
                            debug!("Closing IPC connection idle for {:?}", idle_timeout);
                            return Ok(());
                        }
                        Ok(result) => result,
                    }
                }
                _ = shutdown.wait() => {
                    return Ok(());
                }
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e @ RegistryError::FrameTooLarge { .. }) => {
                    let response = IpcResponse::from_error(None, &e);
                    write_frame(&mut writer, &serde_json::to_vec(&response)?).await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            let response = Self::process_request(&frame, dispatch).await;

            let response_bytes = serde_json::to_vec(&response)?;
            write_frame(&mut writer, &response_bytes).await?;
        }
    }

    async fn process_request<D: IpcDispatch>(frame: &[u8], dispatch: &D) -> IpcResponse {
        let value: serde_json::Value = match serde_json::from_slice(frame) {
            Ok(value) => value,
            Err(e) => {
                let err = RegistryError::Parse {
                    message: e.to_string(),
                };
                return IpcResponse::from_error(None, &err);
            }
        };

        let id = value.get("id").cloned();
        let request: IpcRequest = match serde_json::from_value(value) {
            Ok(req) => req,
            Err(e) => {
                let err = RegistryError::InvalidRequest {
                    message: e.to_string(),
                };
                return IpcResponse::from_error(id, &err);
            }
        };

        if request.jsonrpc != "2.0" {
            let err = RegistryError::InvalidRequest {
                message: "expected jsonrpc 2.0".to_string(),
            };
            return IpcResponse::from_error(request.id, &err);
        }

        let params = request
            .params
            .unwrap_or(serde_json::Value::Object(Default::default()));

        debug!("IPC request {}", request.method);
        let outcome = AssertUnwindSafe(dispatch.dispatch(&request.method, params))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => IpcResponse::success(request.id, result),
            Ok(Err(e)) => {
                if e.is_malformed_request() {
                    debug!("Rejected {} request: {}", request.method, e);
                }
                IpcResponse::from_error(request.id, &e)
            }
            Err(_) => {
                error!("Handler for {} panicked", request.method);
                IpcResponse::error(
                    request.id,
                    codes::INTERNAL_ERROR,
                    "Internal error: request handler panicked".to_string(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    struct EchoDispatch {
        shutdown: ShutdownSignal,
    }

    #[async_trait::async_trait]
    impl IpcDispatch for EchoDispatch {
        async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
            match method {
                "echo" => Ok(params),
                "fail" => Err(RegistryError::NotFound {
                    identifier: "x".to_string(),
                }),
                "panic" => panic!("handler exploded"),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(serde_json::json!("done"))
                }
                "shutdown" => {
                    self.shutdown.trigger();
                    Ok(serde_json::json!("shutting_down"))
                }
                _ => Err(RegistryError::MethodNotFound {
                    method: method.to_string(),
                }),
            }
        }
    }

    async fn start() -> IpcServerHandle {
        let shutdown = ShutdownSignal::new();
        let dispatch = Arc::new(EchoDispatch {
            shutdown: shutdown.clone(),
        });
        IpcServer::bind("127.0.0.1:0".parse().unwrap(), dispatch, shutdown)
            .await
            .unwrap()
    }

    /// Send raw lines on one connection and collect one response per line.
    async fn exchange(addr: SocketAddr, lines: &[&str]) -> Vec<IpcResponse> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut responses = Vec::new();
        for line in lines {
            writer.write_all(line.as_bytes()).await.unwrap();
            writer.write_all(b"\n").await.unwrap();
            let mut buf = String::new();
            reader.read_line(&mut buf).await.unwrap();
            responses.push(serde_json::from_str(&buf).unwrap());
        }
        responses
    }

    fn request(method: &str, params: serde_json::Value) -> String {
        serde_json::to_string(&IpcRequest::new(method, params, 7)).unwrap()
    }

    #[tokio::test]
    async fn test_server_binds_loopback() {
        let handle = start().await;
        assert!(handle.addr().port() > 0);
        assert_eq!(handle.addr().ip(), std::net::Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn test_echo_and_sequential_requests() {
        let handle = start().await;
        let responses = exchange(
            handle.addr(),
            &[
                &request("echo", serde_json::json!({"hello": "world"})),
                &request("echo", serde_json::json!([1, 2])),
            ],
        )
        .await;

        assert_eq!(responses[0].result, Some(serde_json::json!({"hello": "world"})));
        assert_eq!(responses[0].id, Some(serde_json::json!(7)));
        assert_eq!(responses[1].result, Some(serde_json::json!([1, 2])));
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let handle = start().await;
        let responses = exchange(
            handle.addr(),
            &[
                "not valid json",
                r#"{"jsonrpc":"1.0","method":"echo","id":1}"#,
                r#"{"jsonrpc":"2.0","id":2}"#,
                &request("fail", serde_json::json!({})),
                &request("nope", serde_json::json!({})),
            ],
        )
        .await;

        let codes: Vec<i32> = responses
            .iter()
            .map(|r| r.error.as_ref().unwrap().code)
            .collect();
        assert_eq!(codes, vec![-32700, -32600, -32600, -32002, -32601]);
        assert_eq!(responses[2].id, Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let handle = start().await;
        let responses = exchange(
            handle.addr(),
            &[
                &request("panic", serde_json::json!({})),
                &request("echo", serde_json::json!("still alive")),
            ],
        )
        .await;

        assert_eq!(responses[0].error.as_ref().unwrap().code, -32000);
        assert_eq!(responses[1].result, Some(serde_json::json!("still alive")));
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_and_refuses_new() {
        let handle = start().await;
        let addr = handle.addr();

        let slow = tokio::spawn(async move {
            exchange(addr, &[&request("slow", serde_json::json!({}))]).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let responses = exchange(addr, &[&request("shutdown", serde_json::json!({}))]).await;
        assert_eq!(responses[0].result, Some(serde_json::json!("shutting_down")));

        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap();

        let slow = slow.await.unwrap();
        assert_eq!(slow[0].result, Some(serde_json::json!("done")));
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_idle_connection_closed_on_shutdown() {
        let handle = start().await;
        let stream = TcpStream::connect(handle.addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap();

        let mut reader = BufReader::new(stream);
        let mut buf = String::new();
        assert_eq!(reader.read_line(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_silent_connection_is_closed_after_idle_timeout() {
        let shutdown = ShutdownSignal::new();
        let dispatch = Arc::new(EchoDispatch {
            shutdown: shutdown.clone(),
        });
        let handle = IpcServer::bind_with_idle_timeout(
            "127.0.0.1:0".parse().unwrap(),
            dispatch,
            shutdown,
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        let silent = TcpStream::connect(handle.addr()).await.unwrap();
        let mut reader = BufReader::new(silent);
        let mut buf = String::new();
        let read = tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut buf))
            .await
            .expect("idle connection was not closed")
            .unwrap();
        assert_eq!(read, 0);

        let responses = exchange(handle.addr(), &[&request("echo", serde_json::json!(1))]).await;
        assert_eq!(responses[0].result, Some(serde_json::json!(1)));
    }
}
