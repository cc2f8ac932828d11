//! Outbound request shapes consumed by the engine.
//!
//! The wire codec is a collaborator; these are the already-shaped requests
//! the application hands to `register_item` / `reissue` / `submit_*`. A
//! request identifies its target either by service name or by numeric
//! service id — the engine resolves whichever is present through the
//! directory lookup before submitting.

use super::domain::DomainType;

/// An item stream request (open or reissue).
#[derive(Debug, Clone)]
pub struct ItemRequest {
    /// Item name (e.g. an instrument code). Empty only for login/directory
    /// domain requests.
    pub name: String,
    /// Service identification by name. Takes precedence over `service_id`.
    pub service_name: Option<String>,
    /// Service identification by numeric id.
    pub service_id: Option<u32>,
    pub domain: DomainType,
    /// Requested protocol stream id; 0 means the engine assigns one.
    pub stream_id: i32,
    /// Open as a private stream.
    pub private_stream: bool,
    /// Streaming (true) or snapshot (false) request.
    pub streaming: bool,
    /// Batch request: open one sub-stream per listed name. Non-empty makes
    /// this a batch open regardless of `name`.
    pub batch_names: Vec<String>,
}

impl ItemRequest {
    pub fn market_price(name: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_name: Some(service_name.into()),
            service_id: None,
            domain: DomainType::MarketPrice,
            stream_id: 0,
            private_stream: false,
            streaming: true,
            batch_names: Vec::new(),
        }
    }

    pub fn is_batch(&self) -> bool {
        !self.batch_names.is_empty()
    }
}

/// Class-of-service negotiated when opening a tunnel stream.
#[derive(Debug, Clone)]
pub struct ClassOfService {
    pub max_msg_size: u32,
    pub recv_window_size: i32,
    pub send_window_size: i32,
}

impl Default for ClassOfService {
    fn default() -> Self {
        Self {
            max_msg_size: 6144,
            recv_window_size: -1,
            send_window_size: -1,
        }
    }
}

/// A tunnel stream open request.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub name: String,
    pub service_name: Option<String>,
    pub service_id: Option<u32>,
    pub domain: DomainType,
    pub class_of_service: ClassOfService,
    pub guaranteed_output_buffers: u32,
    pub response_timeout_secs: u32,
    /// Optional login request embedded in the tunnel negotiation.
    pub login_payload: Option<Vec<u8>>,
}

impl TunnelRequest {
    pub fn new(name: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_name: Some(service_name.into()),
            service_id: None,
            domain: DomainType::System,
            class_of_service: ClassOfService::default(),
            guaranteed_output_buffers: 50,
            response_timeout_secs: 60,
            login_payload: None,
        }
    }
}

/// A post message submitted on an existing stream.
#[derive(Debug, Clone)]
pub struct PostMsg {
    pub payload: Vec<u8>,
    /// Domain override; `None` uses the item's domain.
    pub domain: Option<DomainType>,
}

/// A generic (bi-directional) message submitted on an existing stream.
#[derive(Debug, Clone)]
pub struct GenericMsg {
    pub payload: Vec<u8>,
    pub domain: Option<DomainType>,
}
