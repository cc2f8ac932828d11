//! Collaborator contracts: directory lookup, transport channel, wire codec.
//!
//! The engine never touches sockets or wire bytes itself. It resolves
//! services through [`Directory`], submits shaped messages through
//! [`Transport`], and encodes tunnel sub-stream traffic through
//! [`SubMsgCodec`]. An in-process [`ChannelTransport`] built on bounded
//! crossbeam channels is provided for tests and local wiring.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use thiserror::Error;

use omx_core::{
    ChannelId, DomainType, ItemMsg, ServiceRecord, StreamState, TunnelRequest,
};

// ---------------------------------------------------------------------------
// Directory lookup
// ---------------------------------------------------------------------------

/// Resolves a service name or numeric id to a routable channel+service
/// record. Fed by the (out-of-scope) service-discovery refresh protocol.
pub trait Directory {
    fn resolve_by_name(&self, name: &str) -> Option<ServiceRecord>;
    fn resolve_by_id(&self, service_id: u32) -> Option<ServiceRecord>;
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

/// A shaped protocol message submitted on a channel's main stream space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMsg {
    Request {
        stream_id: i32,
        domain: DomainType,
        name: String,
        service_name: Option<String>,
        streaming: bool,
        private_stream: bool,
        /// One entry per batch child, in child stream-id order.
        batch_names: Vec<String>,
    },
    Close {
        stream_id: i32,
        domain: DomainType,
    },
    Post {
        stream_id: i32,
        domain: DomainType,
        payload: Vec<u8>,
    },
    Generic {
        stream_id: i32,
        domain: DomainType,
        payload: Vec<u8>,
    },
}

impl OutboundMsg {
    pub fn stream_id(&self) -> i32 {
        match self {
            Self::Request { stream_id, .. }
            | Self::Close { stream_id, .. }
            | Self::Post { stream_id, .. }
            | Self::Generic { stream_id, .. } => *stream_id,
        }
    }
}

/// A message carried inside a tunnel stream's private id space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubStreamMsg {
    Request {
        stream_id: i32,
        domain: DomainType,
        name: String,
        streaming: bool,
        private_stream: bool,
    },
    Close {
        stream_id: i32,
        domain: DomainType,
    },
    Post {
        stream_id: i32,
        domain: DomainType,
        payload: Vec<u8>,
    },
    Generic {
        stream_id: i32,
        domain: DomainType,
        payload: Vec<u8>,
    },
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Failure reported by the channel layer on submit.
#[derive(Debug, Clone, Error)]
#[error("transport error on {channel}: {text}")]
pub struct TransportError {
    pub channel: ChannelId,
    pub text: String,
}

/// A delivery callback from the transport, keyed by stream identity.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Message on a channel's main stream space (login uses the reserved
    /// stream id).
    Msg {
        channel: ChannelId,
        stream_id: i32,
        msg: ItemMsg,
    },
    /// Message for a sub-item inside a tunnel stream.
    TunnelMsg {
        channel: ChannelId,
        tunnel_stream_id: i32,
        sub_stream_id: i32,
        msg: ItemMsg,
    },
    /// Tunnel negotiation status.
    TunnelStatus {
        channel: ChannelId,
        tunnel_stream_id: i32,
        state: StreamState,
    },
    /// A channel completed the login handshake and joins the login scope.
    LoginEstablished { channel: ChannelId },
}

/// The channel layer: owns the sockets and the event delivery queue.
///
/// `submit` is non-blocking; replies arrive later through `poll`.
pub trait Transport {
    fn submit(&mut self, channel: ChannelId, msg: &OutboundMsg) -> Result<(), TransportError>;

    /// Allocate the next protocol stream id on a channel. Ids are assigned
    /// at most once per stream and never reused by the allocator.
    fn next_stream_id(&mut self, channel: ChannelId) -> i32;

    fn open_tunnel(
        &mut self,
        channel: ChannelId,
        request: &TunnelRequest,
        stream_id: i32,
    ) -> Result<(), TransportError>;

    fn close_tunnel(&mut self, channel: ChannelId, stream_id: i32) -> Result<(), TransportError>;

    /// Submit an encoded sub-stream message on an open tunnel.
    fn submit_tunnel(
        &mut self,
        channel: ChannelId,
        tunnel_stream_id: i32,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Drain up to `max` delivered events, waiting at most `timeout` for the
    /// first one.
    fn poll(&mut self, timeout: Duration, max: usize) -> Vec<TransportEvent>;
}

// ---------------------------------------------------------------------------
// Wire codec seam
// ---------------------------------------------------------------------------

/// Encode failure reported by the wire codec.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// Transient: the destination buffer cannot hold the message. The
    /// caller retries with a doubled buffer.
    #[error("buffer too small")]
    BufferTooSmall,
    /// Genuine encode failure; propagates as invalid usage.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Encodes a sub-stream message into a tunnel-scoped buffer.
pub trait SubMsgCodec {
    /// Encode `msg` into `buf`, returning the encoded length.
    fn encode(&self, msg: &SubStreamMsg, buf: &mut [u8]) -> Result<usize, CodecError>;
}

/// Minimal length-prefixed framing for in-process wiring and tests.
///
/// Layout: `[kind u8][domain u8][stream_id i32 LE][body len u32 LE][body]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl SubMsgCodec for FrameCodec {
    fn encode(&self, msg: &SubStreamMsg, buf: &mut [u8]) -> Result<usize, CodecError> {
        let (kind, domain, stream_id, body): (u8, DomainType, i32, &[u8]) = match msg {
            SubStreamMsg::Request {
                stream_id,
                domain,
                name,
                ..
            } => (0, *domain, *stream_id, name.as_bytes()),
            SubStreamMsg::Close { stream_id, domain } => (1, *domain, *stream_id, &[]),
            SubStreamMsg::Post {
                stream_id,
                domain,
                payload,
            } => (2, *domain, *stream_id, payload),
            SubStreamMsg::Generic {
                stream_id,
                domain,
                payload,
            } => (3, *domain, *stream_id, payload),
        };

        let needed = 10 + body.len();
        if buf.len() < needed {
            return Err(CodecError::BufferTooSmall);
        }

        buf[0] = kind;
        buf[1] = domain.as_u8();
        buf[2..6].copy_from_slice(&stream_id.to_le_bytes());
        buf[6..10].copy_from_slice(&(body.len() as u32).to_le_bytes());
        buf[10..needed].copy_from_slice(body);
        Ok(needed)
    }
}

// ---------------------------------------------------------------------------
// ChannelTransport — in-process transport over crossbeam channels
// ---------------------------------------------------------------------------

/// Record of one outbound submission, kept for inspection.
#[derive(Debug, Clone)]
pub enum Submission {
    Msg(ChannelId, OutboundMsg),
    TunnelOpen(ChannelId, i32, String),
    TunnelClose(ChannelId, i32),
    TunnelPayload(ChannelId, i32, Vec<u8>),
}

/// In-process [`Transport`]: outbound submissions are recorded, inbound
/// events are injected through a bounded crossbeam channel and drained by
/// `poll`. Stream ids are allocated per channel starting at 5, below which
/// sit the reserved login/directory/dictionary streams.
pub struct ChannelTransport {
    events_tx: Sender<TransportEvent>,
    events_rx: Receiver<TransportEvent>,
    next_ids: ahash::AHashMap<ChannelId, i32>,
    pub submissions: Vec<Submission>,
    /// When set, every submit on this channel fails with the given text.
    pub fail_channel: Option<(ChannelId, String)>,
}

/// First stream id handed out for application item streams.
pub const FIRST_ITEM_STREAM_ID: i32 = 5;

impl ChannelTransport {
    pub fn new(event_queue_size: usize) -> Self {
        let (events_tx, events_rx) = bounded(event_queue_size);
        Self {
            events_tx,
            events_rx,
            next_ids: ahash::AHashMap::new(),
            submissions: Vec::new(),
            fail_channel: None,
        }
    }

    /// Sender half for injecting delivery events from another thread.
    pub fn injector(&self) -> Sender<TransportEvent> {
        self.events_tx.clone()
    }

    /// Inject a delivery event directly.
    pub fn inject(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    fn check_fail(&self, channel: ChannelId) -> Result<(), TransportError> {
        if let Some((ch, text)) = &self.fail_channel {
            if *ch == channel {
                return Err(TransportError {
                    channel,
                    text: text.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Transport for ChannelTransport {
    fn submit(&mut self, channel: ChannelId, msg: &OutboundMsg) -> Result<(), TransportError> {
        self.check_fail(channel)?;
        self.submissions.push(Submission::Msg(channel, msg.clone()));
        Ok(())
    }

    fn next_stream_id(&mut self, channel: ChannelId) -> i32 {
        let next = self.next_ids.entry(channel).or_insert(FIRST_ITEM_STREAM_ID);
        let id = *next;
        *next += 1;
        id
    }

    fn open_tunnel(
        &mut self,
        channel: ChannelId,
        request: &TunnelRequest,
        stream_id: i32,
    ) -> Result<(), TransportError> {
        self.check_fail(channel)?;
        self.submissions
            .push(Submission::TunnelOpen(channel, stream_id, request.name.clone()));
        Ok(())
    }

    fn close_tunnel(&mut self, channel: ChannelId, stream_id: i32) -> Result<(), TransportError> {
        self.check_fail(channel)?;
        self.submissions.push(Submission::TunnelClose(channel, stream_id));
        Ok(())
    }

    fn submit_tunnel(
        &mut self,
        channel: ChannelId,
        tunnel_stream_id: i32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.check_fail(channel)?;
        self.submissions.push(Submission::TunnelPayload(
            channel,
            tunnel_stream_id,
            payload.to_vec(),
        ));
        Ok(())
    }

    fn poll(&mut self, timeout: Duration, max: usize) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        if max == 0 {
            return out;
        }
        match self.events_rx.recv_timeout(timeout) {
            Ok(ev) => out.push(ev),
            Err(_) => return out,
        }
        while out.len() < max {
            match self.events_rx.try_recv() {
                Ok(ev) => out.push(ev),
                Err(_) => break,
            }
        }
        out
    }
}

/// Static directory over a fixed service set.
pub struct StaticDirectory {
    services: Vec<ServiceRecord>,
}

impl StaticDirectory {
    pub fn new(services: Vec<ServiceRecord>) -> Self {
        Self { services }
    }
}

impl Directory for StaticDirectory {
    fn resolve_by_name(&self, name: &str) -> Option<ServiceRecord> {
        self.services.iter().find(|s| s.name == name).cloned()
    }

    fn resolve_by_id(&self, service_id: u32) -> Option<ServiceRecord> {
        self.services.iter().find(|s| s.service_id == service_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_codec_reports_small_buffer() {
        let codec = FrameCodec;
        let msg = SubStreamMsg::Generic {
            stream_id: 5,
            domain: DomainType::MarketPrice,
            payload: vec![0u8; 300],
        };
        let mut small = [0u8; 256];
        assert!(matches!(
            codec.encode(&msg, &mut small),
            Err(CodecError::BufferTooSmall)
        ));

        let mut big = vec![0u8; 512];
        let n = codec.encode(&msg, &mut big).unwrap();
        assert_eq!(n, 310);
        assert_eq!(big[0], 3);
    }

    #[test]
    fn stream_ids_are_sequential_per_channel() {
        let mut t = ChannelTransport::new(8);
        let a = ChannelId(1);
        let b = ChannelId(2);
        assert_eq!(t.next_stream_id(a), 5);
        assert_eq!(t.next_stream_id(a), 6);
        assert_eq!(t.next_stream_id(b), 5);
    }

    #[test]
    fn poll_drains_up_to_max() {
        let mut t = ChannelTransport::new(8);
        for _ in 0..3 {
            t.inject(TransportEvent::LoginEstablished { channel: ChannelId(1) });
        }
        let evs = t.poll(Duration::from_millis(1), 2);
        assert_eq!(evs.len(), 2);
        let evs = t.poll(Duration::from_millis(1), 8);
        assert_eq!(evs.len(), 1);
    }
}
