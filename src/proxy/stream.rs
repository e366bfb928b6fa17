//! Synchronized wrapper around the single client-facing stream

use std::sync::Mutex;

use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::{Status, Streaming};

use crate::codec::Frame;

/// Reply-side state guarded by the send-family lock.
struct ReplyState {
    header: MetadataMap,
    trailer: MetadataMap,
    reply: Option<Frame>,
}

impl Default for ReplyState {
    fn default() -> Self {
        Self {
            header: MetadataMap::new(),
            trailer: MetadataMap::new(),
            reply: None,
        }
    }
}

/// The inbound stream, shared by the broadcast and fan-in pipelines.
///
/// Two independent guards: one for the send family (headers, trailers and
/// the merged reply, which must stay coherent with each other) and one for
/// receives. Concurrent send-family callers are serialized and a sender
/// never interleaves with a receiver. Ordering beyond mutual exclusion is
/// the caller's business - the fan-in coordinator sequences its own
/// metadata-before-payload order.
pub struct SharedDownstream {
    recv: tokio::sync::Mutex<Streaming<Frame>>,
    send: Mutex<ReplyState>,
}

/// Everything the reply needs once the call reaches a terminal state.
pub struct ReplyParts {
    pub header: MetadataMap,
    pub trailer: MetadataMap,
    pub reply: Option<Frame>,
}

impl SharedDownstream {
    pub fn new(inbound: Streaming<Frame>) -> Self {
        Self {
            recv: tokio::sync::Mutex::new(inbound),
            send: Mutex::new(ReplyState::default()),
        }
    }

    /// Receive the next frame from the caller. `Ok(None)` is half-close.
    pub async fn recv(&self) -> Result<Option<Frame>, Status> {
        self.recv.lock().await.message().await
    }

    /// Merge response header metadata; callable any number of times before
    /// the reply goes out.
    pub fn set_header(&self, metadata: MetadataMap) {
        let mut state = self.send.lock().unwrap();
        merge_metadata(&mut state.header, &metadata);
    }

    /// Merge trailer metadata to accompany the final status.
    pub fn set_trailer(&self, metadata: MetadataMap) {
        let mut state = self.send.lock().unwrap();
        merge_metadata(&mut state.trailer, &metadata);
    }

    /// Stage the merged reply frame. At most one reply per call.
    pub fn send_reply(&self, frame: Frame) -> Result<(), Status> {
        let mut state = self.send.lock().unwrap();
        if state.reply.is_some() {
            return Err(Status::internal("reply already sent downstream"));
        }
        state.reply = Some(frame);
        Ok(())
    }

    /// Take the accumulated reply parts; called once the call is terminal.
    pub fn take_reply(&self) -> ReplyParts {
        let mut state = self.send.lock().unwrap();
        ReplyParts {
            header: std::mem::take(&mut state.header),
            trailer: std::mem::take(&mut state.trailer),
            reply: state.reply.take(),
        }
    }
}

/// Append every entry of `src` onto `dst` (grpc header/trailer merge
/// semantics: repeated keys accumulate).
fn merge_metadata(dst: &mut MetadataMap, src: &MetadataMap) {
    for entry in src.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                dst.append(key.clone(), value.clone());
            }
            KeyAndValueRef::Binary(key, value) => {
                dst.append_bin(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes, BytesMut};
    use http_body_util::Full;
    use std::sync::Arc;

    use crate::codec::RawDecoder;

    fn grpc_frame(payload: &[u8]) -> Bytes {
        let mut framed = BytesMut::with_capacity(payload.len() + 5);
        framed.put_u8(0);
        framed.put_u32(payload.len() as u32);
        framed.put_slice(payload);
        framed.freeze()
    }

    fn downstream_with(payloads: &[&[u8]]) -> SharedDownstream {
        let mut body = BytesMut::new();
        for payload in payloads {
            body.extend_from_slice(&grpc_frame(payload));
        }
        let inbound = Streaming::new_request(RawDecoder, Full::new(body.freeze()), None, None);
        SharedDownstream::new(inbound)
    }

    #[tokio::test]
    async fn test_recv_yields_frames_then_half_close() {
        let downstream = downstream_with(&[b"F1", b"F2"]);

        assert_eq!(
            downstream.recv().await.unwrap().unwrap(),
            Bytes::from_static(b"F1")
        );
        assert_eq!(
            downstream.recv().await.unwrap().unwrap(),
            Bytes::from_static(b"F2")
        );
        assert!(downstream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_header_merge_accumulates() {
        let downstream = downstream_with(&[]);

        let mut first = MetadataMap::new();
        first.insert("x-backend", "shard-a".parse().unwrap());
        let mut second = MetadataMap::new();
        second.insert("x-backend", "shard-b".parse().unwrap());

        downstream.set_header(first);
        downstream.set_header(second);

        let parts = downstream.take_reply();
        let values: Vec<_> = parts.header.get_all("x-backend").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn test_reply_sent_at_most_once() {
        let downstream = downstream_with(&[]);

        downstream.send_reply(Bytes::from_static(b"merged")).unwrap();
        let err = downstream
            .send_reply(Bytes::from_static(b"again"))
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn test_take_reply_drains_state() {
        let downstream = downstream_with(&[]);

        let mut trailer = MetadataMap::new();
        trailer.insert("x-done", "yes".parse().unwrap());
        downstream.set_trailer(trailer);
        downstream.send_reply(Bytes::from_static(b"merged")).unwrap();

        let parts = downstream.take_reply();
        assert_eq!(parts.reply.unwrap(), Bytes::from_static(b"merged"));
        assert_eq!(parts.trailer.get("x-done").unwrap(), "yes");

        let drained = downstream.take_reply();
        assert!(drained.reply.is_none());
        assert!(drained.trailer.get("x-done").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_senders_both_land() {
        let downstream = Arc::new(downstream_with(&[]));

        let mut tasks = Vec::new();
        for backend in ["shard-a", "shard-b"] {
            let downstream = downstream.clone();
            tasks.push(tokio::spawn(async move {
                let mut md = MetadataMap::new();
                md.insert("x-backend", backend.parse().unwrap());
                downstream.set_header(md);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let parts = downstream.take_reply();
        assert_eq!(parts.header.get_all("x-backend").iter().count(), 2);
    }
}
