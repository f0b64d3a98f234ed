use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::protocol::error::{Result, WrapmgrError};
use crate::protocol::{Method, Request, Response};
use crate::transport::codec::JsonCodec;
use crate::transport::tcp::{receive_message, send_message};

/// Server-side handler for the framed RPC protocol.
///
/// Unary methods go through [`call`](CallHandler::call). For streaming
/// methods the server hands every inbound frame of the connection to
/// [`open_stream`](CallHandler::open_stream) and writes each produced
/// response back in order.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// Handles one unary request.
    async fn call(&self, request: Request) -> Response;

    /// Turns a stream of inbound frames into a stream of replies.
    ///
    /// The returned stream should yield exactly one response per request and
    /// end once `requests` ends.
    fn open_stream(
        self: Arc<Self>,
        method: Method,
        requests: BoxStream<'static, Request>,
    ) -> BoxStream<'static, Response>;
}

/// Async TCP server for the wrapper manager RPC front.
///
/// Each accepted connection runs on its own task. A connection serves unary
/// calls (keep-alive) until its first streaming frame arrives; from then on
/// it belongs to that stream until the client half-closes.
pub struct RpcServer {
    listener: TcpListener,
}

impl RpcServer {
    /// Creates a new server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "127.0.0.1:18923")
    pub async fn new(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| WrapmgrError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| WrapmgrError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Serves connections until an accept error occurs.
    pub async fn run<H: CallHandler>(&self, handler: Arc<H>) -> Result<()> {
        self.run_until(handler, std::future::pending()).await
    }

    /// Serves connections until `shutdown` resolves.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn run_until<H, S>(&self, handler: Arc<H>, shutdown: S) -> Result<()>
    where
        H: CallHandler,
        S: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = self.listener.accept() => accepted.map_err(|e| {
                    WrapmgrError::Connection(format!("Failed to accept connection: {}", e))
                })?,
                _ = &mut shutdown => {
                    info!("RPC server shutting down");
                    return Ok(());
                }
            };

            debug!("Connection established from {}", peer_addr);

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler).await {
                    warn!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Processes frames from one connection until it closes.
async fn handle_connection<H: CallHandler>(stream: TcpStream, handler: Arc<H>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let Some(frame) = receive_message(&mut reader).await? else {
            debug!("Connection closed by peer");
            return Ok(());
        };

        let request = match JsonCodec::decode_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to decode request: {}", e);
                send_response(&mut writer, &Response::failure(0, e.to_string())).await?;
                continue;
            }
        };

        if request.method.is_streaming() {
            let method = request.method;
            let requests = stream::once(async move { request })
                .chain(inbound_frames(reader, method))
                .boxed();

            let mut replies = Arc::clone(&handler).open_stream(method, requests);
            while let Some(response) = replies.next().await {
                send_response(&mut writer, &response).await?;
            }
            let _ = writer.shutdown().await;
            return Ok(());
        }

        let response = handler.call(request).await;
        send_response(&mut writer, &response).await?;
    }
}

/// Decodes the remaining frames of a streaming connection.
///
/// Ends on EOF or on the first frame that cannot be decoded. Frames for a
/// different method are skipped.
fn inbound_frames(reader: OwnedReadHalf, method: Method) -> impl futures::Stream<Item = Request> {
    stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        loop {
            let frame = match receive_message(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return None,
                Err(e) => {
                    warn!("{} stream closed on read error: {}", method, e);
                    return None;
                }
            };

            match JsonCodec::decode_request(&frame) {
                Ok(request) if request.method == method => return Some((request, Some(reader))),
                Ok(request) => {
                    warn!(
                        "Ignoring {} frame on a {} stream (id {})",
                        request.method, method, request.id
                    );
                }
                Err(e) => {
                    warn!("{} stream closed on undecodable frame: {}", method, e);
                    return None;
                }
            }
        }
    })
}

async fn send_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let encoded = JsonCodec::encode_response(response)?;
    send_message(writer, &encoded).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReplyHeader;
    use crate::transport::FrameTransport;
    use serde_json::json;

    /// Echoes args back; streams reply with the running frame count.
    struct EchoHandler;

    #[async_trait]
    impl CallHandler for EchoHandler {
        async fn call(&self, request: Request) -> Response {
            Response {
                id: request.id,
                header: ReplyHeader::success(request.method.as_str()),
                data: request.args,
            }
        }

        fn open_stream(
            self: Arc<Self>,
            _method: Method,
            requests: BoxStream<'static, Request>,
        ) -> BoxStream<'static, Response> {
            requests
                .enumerate()
                .map(|(n, request)| Response {
                    id: request.id,
                    header: ReplyHeader::success("SUCCESS"),
                    data: json!({ "seen": n + 1 }),
                })
                .boxed()
        }
    }

    async fn start_echo_server() -> String {
        let server = RpcServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = server.run(Arc::new(EchoHandler)).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_rpc_server_local_addr() {
        let server = RpcServer::new("127.0.0.1:0").await.unwrap();
        assert!(server.local_addr().is_ok());
    }

    #[tokio::test]
    async fn test_unary_calls_share_a_connection() {
        let addr = start_echo_server().await;
        let transport = FrameTransport::new();
        let mut stream = transport.connect(&addr).await.unwrap();

        for i in 0..3 {
            let request = Request::new(Method::Status, json!({ "n": i }));
            let response = transport.send_request(&mut stream, &request).await.unwrap();
            assert_eq!(response.id, request.id);
            assert_eq!(response.header.msg, "Status");
            assert_eq!(response.data, json!({ "n": i }));
        }
    }

    #[tokio::test]
    async fn test_stream_replies_in_order_until_half_close() {
        let addr = start_echo_server().await;
        let transport = FrameTransport::new();
        let stream = transport.connect(&addr).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let request = Request::new(Method::Decrypt, json!({}));
            ids.push(request.id);
            let encoded = JsonCodec::encode_request(&request).unwrap();
            send_message(&mut writer, &encoded).await.unwrap();
        }
        writer.shutdown().await.unwrap();

        let mut seen = Vec::new();
        while let Some(frame) = receive_message(&mut reader).await.unwrap() {
            let response = JsonCodec::decode_response(&frame).unwrap();
            seen.push((response.id, response.data["seen"].as_u64().unwrap()));
        }

        assert_eq!(seen.len(), 5);
        for (i, (id, count)) in seen.into_iter().enumerate() {
            assert_eq!(id, ids[i]);
            assert_eq!(count, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_undecodable_unary_frame_gets_failure_reply() {
        let addr = start_echo_server().await;
        let transport = FrameTransport::new();
        let mut stream = transport.connect(&addr).await.unwrap();

        send_message(&mut stream, b"not json").await.unwrap();
        let frame = receive_message(&mut stream).await.unwrap().unwrap();
        let response = JsonCodec::decode_response(&frame).unwrap();
        assert_eq!(response.header.code, ReplyHeader::FAILURE);

        // The connection is still usable.
        let request = Request::new(Method::Status, json!({}));
        let response = transport.send_request(&mut stream, &request).await.unwrap();
        assert!(response.header.is_success());
    }

    #[tokio::test]
    async fn test_run_until_stops_accepting() {
        let server = RpcServer::new("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .run_until(Arc::new(EchoHandler), async {
                    let _ = rx.await;
                })
                .await
        });

        tx.send(()).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
