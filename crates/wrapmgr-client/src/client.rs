use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};
use wrapmgr_common::protocol::error::{Result, WrapmgrError};
use wrapmgr_common::protocol::{
    DecryptData, LoginData, LogoutData, LyricsData, LyricsRequest, M3u8Data, M3u8Request, Method,
    Reply, Request, RequestId, StatusData,
};
use wrapmgr_common::transport::{receive_message, send_message, FrameTransport, JsonCodec};

/// Client for the wrapper manager RPC front.
///
/// Unary calls open a fresh connection each, so one client can be shared by
/// concurrent tasks. Streams own their connection.
#[derive(Debug, Clone)]
pub struct ManagerClient {
    addr: String,
    transport: FrameTransport,
}

impl ManagerClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            transport: FrameTransport::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Makes one unary call and decodes the reply.
    ///
    /// A non-success header is returned as a reply, not an error; only
    /// transport and decoding problems fail.
    pub async fn call<A, T>(&self, method: Method, args: &A) -> Result<Reply<T>>
    where
        A: Serialize,
        T: DeserializeOwned,
    {
        let request = Request::with_payload(method, args)?;
        let mut stream = self.transport.connect(&self.addr).await?;
        let response = self.transport.send_request(&mut stream, &request).await?;
        response.into_reply()
    }

    pub async fn status(&self) -> Result<StatusData> {
        let reply: Reply<StatusData> = self.call(Method::Status, &serde_json::json!({})).await?;
        required(reply.into_result()?, Method::Status)
    }

    pub async fn logout(&self, username: &str) -> Result<()> {
        let reply: Reply<LogoutData> = self
            .call(
                Method::Logout,
                &LogoutData {
                    username: username.to_string(),
                },
            )
            .await?;
        reply.into_result().map(|_| ())
    }

    /// Resolves the playlist URL of a song.
    pub async fn m3u8(&self, adam_id: &str) -> Result<String> {
        let reply: Reply<M3u8Data> = self
            .call(
                Method::M3u8,
                &M3u8Request {
                    adam_id: adam_id.to_string(),
                },
            )
            .await?;
        Ok(required(reply.into_result()?, Method::M3u8)?.m3u8)
    }

    /// Fetches a song's lyrics TTML. Empty `language` or `region` leave the
    /// choice to the server.
    pub async fn lyrics(&self, adam_id: &str, language: &str, region: &str) -> Result<String> {
        let reply: Reply<LyricsData> = self
            .call(
                Method::Lyrics,
                &LyricsRequest {
                    adam_id: adam_id.to_string(),
                    language: language.to_string(),
                    region: region.to_string(),
                },
            )
            .await?;
        Ok(required(reply.into_result()?, Method::Lyrics)?.lyrics)
    }

    /// Signs an account in over a Login stream.
    ///
    /// When the server asks for a two-factor code, `two_factor` is awaited
    /// for one and the code is sent on the same stream. Returning `None`
    /// abandons the login.
    pub async fn login<F, Fut>(
        &self,
        username: &str,
        password: &str,
        mut two_factor: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<String>>,
    {
        let mut stream = self.open_stream(Method::Login).await?;
        let mut frame = LoginData {
            username: username.to_string(),
            password: password.to_string(),
            two_step_code: String::new(),
        };

        loop {
            stream.send(&frame).await?;
            let reply: Reply<LoginData> = stream
                .recv()
                .await?
                .ok_or(WrapmgrError::ConnectionClosed)?;

            if reply.header.is_two_factor_required() {
                debug!("Two-factor code requested for {}", username);
                let Some(code) = two_factor().await else {
                    stream.finish().await;
                    return Err(WrapmgrError::InvalidRequest(
                        "two-factor code not provided".to_string(),
                    ));
                };
                frame = LoginData {
                    username: username.to_string(),
                    password: String::new(),
                    two_step_code: code,
                };
                continue;
            }

            stream.finish().await;
            reply.into_result()?;
            info!("Logged in {}", username);
            return Ok(());
        }
    }

    /// Opens a Decrypt stream.
    pub async fn decrypt_stream(&self) -> Result<DecryptStream> {
        Ok(DecryptStream {
            inner: self.open_stream(Method::Decrypt).await?,
        })
    }

    async fn open_stream(&self, method: Method) -> Result<FrameStream> {
        let stream = self.transport.connect(&self.addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(FrameStream {
            method,
            reader,
            writer,
        })
    }
}

fn required<T>(data: Option<T>, method: Method) -> Result<T> {
    data.ok_or_else(|| WrapmgrError::InvalidResponse(format!("{} reply without data", method)))
}

/// One connection bound to a streaming method.
struct FrameStream {
    method: Method,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl FrameStream {
    async fn send<A: Serialize>(&mut self, args: &A) -> Result<RequestId> {
        let request = Request::with_payload(self.method, args)?;
        let encoded = JsonCodec::encode_request(&request)?;
        send_message(&mut self.writer, &encoded).await?;
        Ok(request.id)
    }

    async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<Reply<T>>> {
        match receive_message(&mut self.reader).await? {
            Some(frame) => Ok(Some(JsonCodec::decode_response(&frame)?.into_reply()?)),
            None => Ok(None),
        }
    }

    async fn finish(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// A Decrypt stream.
///
/// Replies arrive in the order frames were sent. [`send`](Self::send) and
/// [`recv`](Self::recv) may be interleaved freely to keep several samples in
/// flight.
pub struct DecryptStream {
    inner: FrameStream,
}

impl DecryptStream {
    pub async fn send(&mut self, data: &DecryptData) -> Result<RequestId> {
        self.inner.send(data).await
    }

    /// Next reply, or `None` once the server has closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Reply<DecryptData>>> {
        self.inner.recv().await
    }

    /// Sends one sample and waits for its plaintext.
    pub async fn decrypt(
        &mut self,
        adam_id: &str,
        key: &str,
        sample_index: u32,
        sample: Vec<u8>,
    ) -> Result<Vec<u8>> {
        self.send(&DecryptData {
            adam_id: adam_id.to_string(),
            key: key.to_string(),
            sample_index,
            sample,
        })
        .await?;
        let reply = self.recv().await?.ok_or(WrapmgrError::ConnectionClosed)?;
        Ok(required(reply.into_result()?, Method::Decrypt)?.sample)
    }

    /// Round-trips a keep-alive frame.
    pub async fn keepalive(&mut self) -> Result<()> {
        self.send(&DecryptData::keepalive()).await?;
        let reply = self.recv().await?.ok_or(WrapmgrError::ConnectionClosed)?;
        reply.into_result().map(|_| ())
    }

    /// Half-closes the stream and collects the replies still in flight.
    pub async fn finish(mut self) -> Result<Vec<Reply<DecryptData>>> {
        self.inner.finish().await;
        let mut pending = Vec::new();
        while let Some(reply) = self.recv().await? {
            pending.push(reply);
        }
        Ok(pending)
    }
}
