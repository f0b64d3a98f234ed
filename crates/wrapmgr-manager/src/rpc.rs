//! Binds [`ServiceFront`] to the framed RPC transport.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use wrapmgr_common::protocol::{DecryptData, LoginData, Method, Reply, Request, Response};
use wrapmgr_common::transport::CallHandler;
use wrapmgr_metrics::StreamGuard;

use crate::dispatcher::Dispatcher;
use crate::service::ServiceFront;

fn respond<T: Serialize>(id: u64, reply: &Reply<T>) -> Response {
    Response::from_reply(id, reply).unwrap_or_else(|e| {
        warn!("Failed to encode reply {}: {}", id, e);
        Response::failure(id, e.to_string())
    })
}

fn decode<T: DeserializeOwned>(request: &Request) -> Result<T, Response> {
    request
        .payload()
        .map_err(|e| Response::failure(request.id, e.to_string()))
}

impl ServiceFront {
    async fn route_unary(&self, request: &Request) -> Result<Response, Response> {
        let id = request.id;
        let response = match request.method {
            Method::Status => respond(id, &self.status()),
            Method::Logout => respond(id, &self.logout(decode(request)?).await),
            Method::M3u8 => respond(id, &self.m3u8(decode(request)?).await),
            Method::Lyrics => respond(id, &self.lyrics(decode(request)?).await),
            Method::License => respond(id, &self.license(decode(request)?)),
            Method::WebPlayback => respond(id, &self.web_playback(decode(request)?)),
            Method::Login | Method::Decrypt => {
                Response::failure(id, format!("{} is a streaming method", request.method))
            }
        };
        Ok(response)
    }
}

/// Per-connection state of a Decrypt stream.
///
/// Holds every `(instance, song)` pair the stream was routed to; the holds
/// are dropped when the stream goes away.
struct DecryptSession {
    dispatcher: Arc<Dispatcher>,
    pinned: Mutex<HashSet<(String, String)>>,
    _active: StreamGuard,
}

impl DecryptSession {
    fn remember(&self, instance_id: &str, adam_id: &str) {
        let pair = (instance_id.to_string(), adam_id.to_string());
        if self.pinned.lock().insert(pair) {
            self.dispatcher.pin(instance_id, adam_id);
        }
    }
}

impl Drop for DecryptSession {
    fn drop(&mut self) {
        for (instance_id, adam_id) in self.pinned.get_mut().drain() {
            let released = self.dispatcher.unpin(&instance_id, &adam_id);
            debug!(
                "Decrypt stream ended, {} on {} released: {}",
                adam_id, instance_id, released
            );
        }
    }
}

#[async_trait]
impl CallHandler for ServiceFront {
    async fn call(&self, request: Request) -> Response {
        let start = Instant::now();
        let response = match self.route_unary(&request).await {
            Ok(response) | Err(response) => response,
        };
        self.metrics()
            .record_call(request.method.as_str(), start, response.header.is_success());
        response
    }

    fn open_stream(
        self: Arc<Self>,
        method: Method,
        requests: BoxStream<'static, Request>,
    ) -> BoxStream<'static, Response> {
        match method {
            Method::Decrypt => {
                let session = Arc::new(DecryptSession {
                    dispatcher: Arc::clone(self.dispatcher()),
                    pinned: Mutex::new(HashSet::new()),
                    _active: self.metrics().track_stream(),
                });

                requests
                    .then(move |request| {
                        let front = Arc::clone(&self);
                        let session = Arc::clone(&session);
                        async move {
                            let start = Instant::now();
                            let response = match decode::<DecryptData>(&request) {
                                Ok(data) => {
                                    let adam_id = data.adam_id.clone();
                                    let (reply, instance_id) = front.decrypt_routed(data).await;
                                    if let Some(instance_id) = instance_id {
                                        session.remember(&instance_id, &adam_id);
                                    }
                                    respond(request.id, &reply)
                                }
                                Err(response) => response,
                            };
                            front.metrics().record_call(
                                Method::Decrypt.as_str(),
                                start,
                                response.header.is_success(),
                            );
                            response
                        }
                    })
                    .boxed()
            }
            Method::Login => {
                let active = Arc::new(self.metrics().track_stream());
                requests
                    .then(move |request| {
                        let front = Arc::clone(&self);
                        let _active = Arc::clone(&active);
                        async move {
                            let start = Instant::now();
                            let response = match decode::<LoginData>(&request) {
                                Ok(data) => respond(request.id, &front.login(data).await),
                                Err(response) => response,
                            };
                            front.metrics().record_call(
                                Method::Login.as_str(),
                                start,
                                response.header.is_success(),
                            );
                            response
                        }
                    })
                    .boxed()
            }
            other => requests
                .map(move |request| {
                    Response::failure(request.id, format!("{} is not a streaming method", other))
                })
                .boxed(),
        }
    }
}
