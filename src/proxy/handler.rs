//! Proxy handler - drives fan-out/fan-in forwarding for one inbound call
//!
//! Each call moves through routing, concurrent backend stream establishment,
//! two forwarding pipelines (downstream-to-backends broadcast and
//! backends-to-downstream merge) and a draining phase that resolves the
//! first terminal outcome. Payloads are never decoded.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use bytes::{BufMut, Bytes, BytesMut};
use futures::future;
use http::header::CONTENT_TYPE;
use http::uri::PathAndQuery;
use http::{HeaderMap, HeaderValue, Request, Response};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tonic::body::{BoxBody, boxed};
use tonic::client::Grpc;
use tonic::codegen::Service;
use tonic::metadata::MetadataMap;
use tonic::{Status, Streaming};

use crate::codec::{Frame, RawCodec, RawDecoder};
use crate::director::{Route, RouteTarget, StreamDirector};
use crate::error::ProxyError;
use crate::metrics;
use crate::proxy::stream::{ReplyParts, SharedDownstream};

/// gRPC message framing overhead: compression flag plus length prefix.
const FRAME_PREFIX_LEN: usize = 5;

/// Follower-owned half of one open backend stream.
struct BackendStream {
    name: String,
    headers: MetadataMap,
    inbound: Streaming<Frame>,
}

/// Transparent per-call proxy: decodes nothing, forwards everything.
///
/// Mounted directly as a tower service so the enclosing server never
/// attempts schema-aware decoding; all framing goes through [`RawCodec`].
pub struct ProxyService<D> {
    director: Arc<D>,
    backend_send_buffer: usize,
}

impl<D> Clone for ProxyService<D> {
    fn clone(&self) -> Self {
        Self {
            director: self.director.clone(),
            backend_send_buffer: self.backend_send_buffer,
        }
    }
}

impl<D: StreamDirector> ProxyService<D> {
    pub fn new(director: Arc<D>, backend_send_buffer: usize) -> Self {
        Self {
            director,
            backend_send_buffer,
        }
    }

    /// Run one call through the ROUTING / STREAMING / DRAINING phases.
    async fn proxy_call(self, req: Request<Body>) -> Result<Response<BoxBody>, Status> {
        // ROUTING: the full method name is the request path, exactly as
        // presented on the wire.
        let full_method = req.uri().path().to_owned();
        let (parts, body) = req.into_parts();
        let inbound_metadata = MetadataMap::from_headers(parts.headers);

        let route = self
            .director
            .route(&inbound_metadata, &full_method)
            .await
            .map_err(Status::from)?;
        if route.backends.is_empty() {
            // A route with zero handles and no error is not a valid outcome.
            return Err(Status::unimplemented(format!(
                "director returned an empty route for {full_method}"
            )));
        }

        let downstream = Arc::new(SharedDownstream::new(Streaming::new_request(
            RawDecoder, body, None, None,
        )));

        // STREAMING: all backend streams must be open before the first frame
        // is forwarded anywhere - backend establishment is all-or-nothing.
        let backends = self.open_backends(&route, &full_method).await?;

        tracing::debug!(
            method = %full_method,
            backends = backends.len(),
            "Backend streams open, forwarding"
        );

        // Every forwarding task lives in this set; dropping it (terminal
        // state or caller disconnect) tears down all backend streams.
        let mut tasks = JoinSet::new();

        let mut senders = Vec::with_capacity(backends.len());
        let mut followers = Vec::with_capacity(backends.len());
        for (sender, backend) in backends {
            senders.push((backend.name.clone(), sender));
            followers.push(backend);
        }

        let (broadcast_err_tx, mut broadcast_err_rx) = oneshot::channel::<ProxyError>();
        {
            let downstream = downstream.clone();
            tasks.spawn(async move {
                // Only errors are reported; on clean half-close the sender is
                // simply dropped.
                if let Err(err) = broadcast(downstream, senders).await {
                    let _ = broadcast_err_tx.send(err);
                }
            });
        }

        // Delivery lane buffered to the backend count so fast followers are
        // not serialized behind each other.
        let (delivery_tx, delivery_rx) = mpsc::channel::<Frame>(followers.len().max(1));
        for backend in followers {
            let downstream = downstream.clone();
            let delivery = delivery_tx.clone();
            tasks.spawn(follow_backend(backend, downstream, delivery));
        }
        drop(delivery_tx);

        let (merge_tx, mut merge_rx) = oneshot::channel::<Result<(), ProxyError>>();
        {
            let downstream = downstream.clone();
            tasks.spawn(async move {
                let _ = merge_tx.send(merge_replies(delivery_rx, downstream).await);
            });
        }

        // DRAINING: whichever pipeline terminates first decides the call.
        let mut downstream_open = true;
        loop {
            tokio::select! {
                res = &mut broadcast_err_rx, if downstream_open => match res {
                    Ok(err) => {
                        tasks.abort_all();
                        return Err(Status::internal(format!(
                            "failed proxying downstream to backends: {err}"
                        )));
                    }
                    // Sender dropped without a value: the caller half-closed
                    // cleanly, keep draining the fan-in side.
                    Err(_) => downstream_open = false,
                },
                res = &mut merge_rx => {
                    return match res {
                        Ok(Ok(())) => Ok(reply_response(downstream.take_reply())),
                        Ok(Err(err)) => Err(Status::from(err)),
                        Err(_) => Err(Status::internal(
                            "reply pipeline terminated without a result",
                        )),
                    };
                }
            }
        }
    }

    async fn open_backends(
        &self,
        route: &Route,
        full_method: &str,
    ) -> Result<Vec<(mpsc::Sender<Frame>, BackendStream)>, Status> {
        let opens = route.backends.iter().map(|target| {
            self.open_backend(
                target.clone(),
                route.metadata.clone(),
                route.timeout,
                full_method,
            )
        });
        future::try_join_all(opens).await
    }

    /// Open one bidirectional raw-codec stream against one backend.
    async fn open_backend(
        &self,
        target: RouteTarget,
        metadata: MetadataMap,
        timeout: Option<Duration>,
        full_method: &str,
    ) -> Result<(mpsc::Sender<Frame>, BackendStream), Status> {
        let path = PathAndQuery::from_maybe_shared(full_method.to_owned())
            .map_err(|e| Status::internal(format!("invalid method path {full_method}: {e}")))?;

        let mut grpc = Grpc::new(target.channel);
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("backend {} not ready: {e}", target.name)))?;

        let (sender, request_lane) = mpsc::channel::<Frame>(self.backend_send_buffer);
        let mut request = tonic::Request::new(ReceiverStream::new(request_lane));
        *request.metadata_mut() = metadata;
        if let Some(timeout) = timeout {
            request.set_timeout(timeout);
        }

        let response = grpc
            .streaming(request, path, RawCodec)
            .await
            .map_err(|status| {
                Status::unavailable(format!(
                    "failed opening stream to backend {}: {}",
                    target.name,
                    status.message()
                ))
            })?;

        let (headers, inbound, _extensions) = response.into_parts();
        Ok((
            sender,
            BackendStream {
                name: target.name,
                headers,
                inbound,
            },
        ))
    }
}

impl<D: StreamDirector> Service<Request<Body>> for ProxyService<D> {
    type Response = Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let method = req.uri().path().to_owned();
            metrics::record_call_started(&method);
            let response = match this.proxy_call(req).await {
                Ok(response) => {
                    metrics::record_call_completed(&method);
                    response
                }
                Err(status) => {
                    metrics::record_call_failed(&method, status.code());
                    tracing::debug!(
                        method = %method,
                        code = ?status.code(),
                        error = %status.message(),
                        "Call failed"
                    );
                    status.into_http()
                }
            };
            Ok(response)
        })
    }
}

/// downstream-to-backends pipeline: every caller frame is repeated,
/// unmodified, to every backend request lane in route order. Ends cleanly on
/// half-close by dropping the lanes, which tells each backend no further
/// input is coming.
async fn broadcast(
    downstream: Arc<SharedDownstream>,
    senders: Vec<(String, mpsc::Sender<Frame>)>,
) -> Result<(), ProxyError> {
    loop {
        match downstream.recv().await {
            Ok(Some(frame)) => {
                metrics::record_frames_forwarded("downstream_to_backends", senders.len() as u64);
                for (name, sender) in &senders {
                    // Frame clones share the payload bytes; nothing is copied.
                    if sender.send(frame.clone()).await.is_err() {
                        return Err(ProxyError::BackendUnavailable {
                            backend: name.clone(),
                            reason: "request stream closed".to_string(),
                        });
                    }
                }
            }
            Ok(None) => return Ok(()),
            Err(status) => return Err(ProxyError::DownstreamReceive(status.to_string())),
        }
    }
}

/// One backends-to-downstream follower: pushes every frame from its backend
/// onto the shared delivery lane. Header metadata is staged ahead of the
/// first frame, trailer metadata at end-of-input. A receive failure ends
/// only this follower; the merge proceeds with the remaining backends.
async fn follow_backend(
    mut backend: BackendStream,
    downstream: Arc<SharedDownstream>,
    delivery: mpsc::Sender<Frame>,
) {
    let mut first = true;
    loop {
        match backend.inbound.message().await {
            Ok(Some(frame)) => {
                if first {
                    // Headers must reach the caller before any payload; the
                    // wrapper stages them until the merged reply goes out.
                    downstream.set_header(backend.headers.clone());
                    first = false;
                }
                metrics::record_frames_forwarded("backends_to_downstream", 1);
                if delivery.send(frame).await.is_err() {
                    // Merge coordinator is gone; the call is terminal.
                    return;
                }
            }
            Ok(None) => {
                match backend.inbound.trailers().await {
                    Ok(Some(trailer)) => downstream.set_trailer(trailer),
                    Ok(None) => {}
                    Err(status) => tracing::warn!(
                        backend = %backend.name,
                        error = %status,
                        "Failed reading backend trailers"
                    ),
                }
                return;
            }
            Err(status) => {
                tracing::warn!(
                    backend = %backend.name,
                    error = %status,
                    "Error receiving from backend stream"
                );
                return;
            }
        }
    }
}

/// Fan-in coordinator: drains the delivery lane until every follower has
/// dropped its sender, then stages the concatenation as the single merged
/// reply. Delivery order is receive-completion order; frames from the same
/// backend keep their relative order.
async fn merge_replies(
    mut delivery: mpsc::Receiver<Frame>,
    downstream: Arc<SharedDownstream>,
) -> Result<(), ProxyError> {
    let mut merged = BytesMut::new();
    while let Some(frame) = delivery.recv().await {
        merged.extend_from_slice(&frame);
    }
    downstream
        .send_reply(merged.freeze())
        .map_err(|status| ProxyError::DownstreamSend(status.message().to_string()))
}

/// Materialize the terminal response: propagated headers, one merged data
/// frame, trailers with the final status.
fn reply_response(parts: ReplyParts) -> Response<BoxBody> {
    let ReplyParts {
        header,
        trailer,
        reply,
    } = parts;

    let mut trailers = trailer.into_headers();
    trailers.insert("grpc-status", HeaderValue::from_static("0"));

    let body = ReplyBody::new(reply.unwrap_or_default(), trailers);

    let mut response = Response::new(boxed(body));
    *response.headers_mut() = header.into_headers();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    response
}

/// Single-frame gRPC reply body: one length-prefixed data frame followed by
/// trailers.
struct ReplyBody {
    payload: Option<Frame>,
    trailers: Option<HeaderMap>,
}

impl ReplyBody {
    fn new(payload: Frame, trailers: HeaderMap) -> Self {
        Self {
            payload: Some(payload),
            trailers: Some(trailers),
        }
    }
}

impl http_body::Body for ReplyBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(payload) = this.payload.take() {
            let mut framed = BytesMut::with_capacity(payload.len() + FRAME_PREFIX_LEN);
            framed.put_u8(0);
            framed.put_u32(payload.len() as u32);
            framed.extend_from_slice(&payload);
            return Poll::Ready(Some(Ok(http_body::Frame::data(framed.freeze()))));
        }
        if let Some(trailers) = this.trailers.take() {
            return Poll::Ready(Some(Ok(http_body::Frame::trailers(trailers))));
        }
        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.payload.is_none() && self.trailers.is_none()
    }
}
