//! The consumer engine: registration surface and dispatch cycle.
//!
//! All engine calls execute on the caller's thread. `register_*`,
//! `reissue`, `submit_*`, and `unregister` mutate the item set and submit
//! protocol messages; `dispatch` drains transport events and due timers and
//! invokes client callbacks. Client callbacks are never invoked from inside
//! a registration call — failures detected during registration surface as a
//! deferred closed status delivered on a later `dispatch`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use tracing::{debug, error, warn};

use omx_core::{
    ChannelId, ClosedStatus, ConsumerConfig, DomainType, GenericMsg, ItemMsg, ItemRequest,
    MsgKind, OmxError, PostMsg, StreamState, StreamStateKind, TunnelRequest, LOGIN_STREAM_ID,
};

use crate::client::{notify_error, ConsumerClient, ErrorClient, ItemEvent};
use crate::handle::Handle;
use crate::item::{Item, ItemRole};
use crate::login::LoginScope;
use crate::registry::ItemRegistry;
use crate::timer::{TimerQueue, TimerToken};
use crate::transport::{Directory, OutboundMsg, SubMsgCodec, SubStreamMsg, Transport};
use crate::tunnel::{encode_sub_msg, SubIdError, TunnelMux};

/// Dictionary names the server recognizes.
const FIELD_DICTIONARY_NAME: &str = "RWFFld";
const ENUM_DICTIONARY_NAME: &str = "RWFEnum";

/// One-shot deferred action executed by `dispatch`.
enum TimerAction {
    /// Deliver the synthesized closed status and remove the item.
    DeliverClosedStatus { handle: Handle, status: ClosedStatus },
    /// Deliver the synthetic login refresh to an item registered after the
    /// login handshake already completed.
    LoginReady { handle: Handle },
}

pub struct ConsumerEngine<T, D, C>
where
    T: Transport,
    D: Directory,
    C: SubMsgCodec,
{
    config: ConsumerConfig,
    transport: T,
    directory: D,
    codec: C,
    registry: ItemRegistry,
    timers: TimerQueue<TimerAction>,
    /// Pending deferred-close tokens, canceled when the item is removed
    /// before the deadline.
    pending_close: AHashMap<Handle, TimerToken>,
    login: LoginScope,
    error_client: Option<Arc<dyn ErrorClient>>,
}

impl<T, D, C> ConsumerEngine<T, D, C>
where
    T: Transport,
    D: Directory,
    C: SubMsgCodec,
{
    pub fn new(config: ConsumerConfig, transport: T, directory: D, codec: C) -> Self {
        let hint = config.item_count_hint;
        Self {
            config,
            transport,
            directory,
            codec,
            registry: ItemRegistry::with_capacity(hint),
            timers: TimerQueue::new(),
            pending_close: AHashMap::new(),
            login: LoginScope::new(),
            error_client: None,
        }
    }

    /// Install the error receiver. From then on registration-surface errors
    /// are routed to it and the failing call returns [`Handle::NONE`]
    /// (or `Ok(())`) instead of `Err`.
    pub fn set_error_client(&mut self, client: Arc<dyn ErrorClient>) {
        self.error_client = Some(client);
    }

    pub fn item_count(&self) -> usize {
        self.registry.len()
    }

    // -----------------------------------------------------------------------
    // Registration surface
    // -----------------------------------------------------------------------

    /// Open an item stream.
    ///
    /// With `parent == Handle::NONE` the request dispatches on its domain:
    /// login joins the login scope, dictionary validates the dictionary
    /// name, and every market-data domain opens a single or batch stream.
    /// A non-NONE `parent` must name a live tunnel stream and opens the
    /// request as a sub-item inside it.
    pub fn register_item(
        &mut self,
        req: &ItemRequest,
        client: Arc<dyn ConsumerClient>,
        closure: u64,
        parent: Handle,
    ) -> Result<Handle, OmxError> {
        let result = if !parent.is_none() {
            self.register_sub(parent, req, client, closure)
        } else {
            match req.domain {
                DomainType::Login => self.register_login(req, client, closure),
                DomainType::Directory => self.register_directory(req, client, closure),
                DomainType::Dictionary => self.register_dictionary(req, client, closure),
                _ => {
                    if req.is_batch() {
                        self.register_batch(req, client, closure)
                    } else {
                        self.register_single(req, client, closure)
                    }
                }
            }
        };
        self.finish_handle(result)
    }

    /// Open a tunnel stream. The returned handle owns a private sub-stream
    /// id space populated through [`ConsumerEngine::register_item`] with
    /// this handle as the parent.
    pub fn register_tunnel(
        &mut self,
        req: &TunnelRequest,
        client: Arc<dyn ConsumerClient>,
        closure: u64,
    ) -> Result<Handle, OmxError> {
        let result = self.register_tunnel_inner(req, client, closure);
        self.finish_handle(result)
    }

    /// Modify an open stream in place, keeping its stream identity. Batch
    /// parents and tunnel containers cannot be reissued.
    pub fn reissue(&mut self, handle: Handle, req: &ItemRequest) -> Result<(), OmxError> {
        let result = self.reissue_inner(handle, req);
        self.finish_unit(result)
    }

    pub fn submit_post(&mut self, handle: Handle, post: &PostMsg) -> Result<(), OmxError> {
        let result = self.submit_payload(handle, post.domain, &post.payload, true);
        self.finish_unit(result)
    }

    pub fn submit_generic(&mut self, handle: Handle, generic: &GenericMsg) -> Result<(), OmxError> {
        let result = self.submit_payload(handle, generic.domain, &generic.payload, false);
        self.finish_unit(result)
    }

    /// Close the stream and release the handle.
    ///
    /// Batch parents cannot be closed directly; their children close
    /// individually and the parent goes with the last one. Tunnels tear
    /// down their sub-items. Login items are removed without a protocol
    /// close; the login stream closes at [`ConsumerEngine::shutdown`].
    pub fn unregister(&mut self, handle: Handle) -> Result<(), OmxError> {
        let result = self.unregister_inner(handle);
        self.finish_unit(result)
    }

    /// Close the login stream best-effort and forcibly remove every item in
    /// registration order, tolerating items that remove each other during
    /// the sweep.
    pub fn shutdown(&mut self) {
        if self.login.has_items() {
            self.send_login_close();
        }
        let count = self.registry.len();
        for handle in self.registry.handles() {
            // Batch parents and tunnel sub-items may already be gone by the
            // time the sweep reaches them.
            self.drop_item(handle);
        }
        self.timers = TimerQueue::new();
        self.pending_close.clear();
        self.login = LoginScope::new();
        debug!("[engine] shutdown, dropped {count} items");
    }

    // -----------------------------------------------------------------------
    // Dispatch cycle
    // -----------------------------------------------------------------------

    /// Run one dispatch cycle: drain up to `max_dispatch_batch` transport
    /// events, waiting at most `timeout` (shortened when a timer is due
    /// sooner), then execute due deferred actions. Returns the number of
    /// work units processed.
    pub fn dispatch(&mut self, timeout: Duration) -> usize {
        let mut processed = 0;

        let wait = match self.timers.next_deadline(Instant::now()) {
            Some(until_timer) => timeout.min(until_timer),
            None => timeout,
        };
        let events = self.transport.poll(wait, self.config.max_dispatch_batch);
        for event in events {
            processed += 1;
            self.route_event(event);
        }

        for action in self.timers.poll(Instant::now()) {
            processed += 1;
            match action {
                TimerAction::DeliverClosedStatus { handle, status } => {
                    self.pending_close.remove(&handle);
                    self.deliver_closed_status(handle, status);
                }
                TimerAction::LoginReady { handle } => self.deliver_login_ready(handle),
            }
        }
        processed
    }

    /// One cycle with the configured default timeout.
    pub fn dispatch_default(&mut self) -> usize {
        let timeout = Duration::from_millis(self.config.dispatch_timeout_ms);
        self.dispatch(timeout)
    }

    // -----------------------------------------------------------------------
    // Registration internals
    // -----------------------------------------------------------------------

    fn register_single(
        &mut self,
        req: &ItemRequest,
        client: Arc<dyn ConsumerClient>,
        closure: u64,
    ) -> Result<Handle, OmxError> {
        let service = self.resolve_service(req)?;
        let item = Item::from_request(req, ItemRole::Single, client, closure);
        let handle = self.registry.insert(item);

        match service {
            None => {
                self.schedule_closed_status(handle, req, "service not found");
                Ok(handle)
            }
            Some(record) => {
                self.open_on_channel(handle, req, record.channel)?;
                Ok(handle)
            }
        }
    }

    fn register_batch(
        &mut self,
        req: &ItemRequest,
        client: Arc<dyn ConsumerClient>,
        closure: u64,
    ) -> Result<Handle, OmxError> {
        let service = self.resolve_service(req)?;
        let parent_role = ItemRole::BatchParent {
            live_children: req.batch_names.len(),
            children: Vec::with_capacity(req.batch_names.len()),
        };
        let parent = self
            .registry
            .insert(Item::from_request(req, parent_role, client.clone(), closure));

        let record = match service {
            Some(record) => record,
            None => {
                self.schedule_closed_status(parent, req, "service not found");
                return Ok(parent);
            }
        };

        // Children take sequential stream ids so the server's per-name
        // responses land on consecutive streams.
        let mut children = Vec::with_capacity(req.batch_names.len());
        for name in &req.batch_names {
            let stream_id = self.transport.next_stream_id(record.channel);
            let mut child =
                Item::from_request(req, ItemRole::BatchChild { parent }, client.clone(), closure);
            child.name = name.clone();
            child.channel = Some(record.channel);
            child.stream_id = stream_id;
            let child_handle = self.registry.insert(child);
            self.registry.route(record.channel, stream_id, child_handle);
            children.push((child_handle, stream_id));
        }

        let first_stream_id = children.first().map(|(_, id)| *id).unwrap_or_default();
        let group = OutboundMsg::Request {
            stream_id: first_stream_id,
            domain: req.domain,
            name: String::new(),
            service_name: Some(record.name.clone()),
            streaming: req.streaming,
            private_stream: req.private_stream,
            batch_names: req.batch_names.clone(),
        };

        if let Err(err) = self.transport.submit(record.channel, &group) {
            // Unwind the whole group; a half-opened batch is worse than a
            // failed one.
            for (child_handle, _) in &children {
                self.registry.remove(*child_handle);
            }
            self.registry.remove(parent);
            return Err(OmxError::InvalidUsage(format!(
                "batch open failed on {}: {}",
                err.channel, err.text
            )));
        }

        if let Some(item) = self.registry.get_mut(parent) {
            if let ItemRole::BatchParent { children: list, .. } = &mut item.role {
                list.extend(children.iter().map(|(h, _)| *h));
            }
        }
        debug!(
            "[item] batch open: {} children on {}",
            children.len(),
            record.channel
        );
        Ok(parent)
    }

    fn register_login(
        &mut self,
        req: &ItemRequest,
        client: Arc<dyn ConsumerClient>,
        closure: u64,
    ) -> Result<Handle, OmxError> {
        let mut item = Item::from_request(req, ItemRole::Login, client, closure);
        item.stream_id = LOGIN_STREAM_ID;
        let handle = self.registry.insert(item);

        // Login is connection-scoped: the open goes to every established
        // channel, aborting on the first failure.
        for channel in self.login.channels() {
            let msg = OutboundMsg::Request {
                stream_id: LOGIN_STREAM_ID,
                domain: DomainType::Login,
                name: req.name.clone(),
                service_name: None,
                streaming: true,
                private_stream: false,
                batch_names: Vec::new(),
            };
            if let Err(err) = self.transport.submit(channel, &msg) {
                self.registry.remove(handle);
                return Err(OmxError::InvalidUsage(format!(
                    "login open failed on {}: {}",
                    err.channel, err.text
                )));
            }
        }
        self.login.add_item(handle);

        // Channels already logged in will not re-send their refresh; hand
        // this item a synthetic one shortly after registration.
        if !self.login.channels().is_empty() {
            self.timers.schedule(
                Duration::from_millis(self.config.login_ready_delay_ms),
                TimerAction::LoginReady { handle },
            );
        }
        Ok(handle)
    }

    fn register_directory(
        &mut self,
        req: &ItemRequest,
        client: Arc<dyn ConsumerClient>,
        closure: u64,
    ) -> Result<Handle, OmxError> {
        let channel = match self.resolve_service(req) {
            Ok(Some(record)) => Some(record.channel),
            Ok(None) => None,
            // Directory requests may omit the service to ask for the full
            // catalog; route those to the first established channel.
            Err(_) => self.login.channels().first().copied(),
        };

        let item = Item::from_request(req, ItemRole::Directory, client, closure);
        let handle = self.registry.insert(item);
        match channel {
            Some(channel) => {
                self.open_on_channel(handle, req, channel)?;
                Ok(handle)
            }
            None => {
                self.schedule_closed_status(handle, req, "no routable channel for directory");
                Ok(handle)
            }
        }
    }

    fn register_dictionary(
        &mut self,
        req: &ItemRequest,
        client: Arc<dyn ConsumerClient>,
        closure: u64,
    ) -> Result<Handle, OmxError> {
        if req.name != FIELD_DICTIONARY_NAME && req.name != ENUM_DICTIONARY_NAME {
            return Err(OmxError::InvalidUsage(format!(
                "invalid dictionary name '{}', expected '{}' or '{}'",
                req.name, FIELD_DICTIONARY_NAME, ENUM_DICTIONARY_NAME
            )));
        }
        let service = self.resolve_service(req)?;
        let item = Item::from_request(req, ItemRole::Dictionary, client, closure);
        let handle = self.registry.insert(item);
        match service {
            Some(record) => {
                self.open_on_channel(handle, req, record.channel)?;
                Ok(handle)
            }
            None => {
                self.schedule_closed_status(handle, req, "service not found");
                Ok(handle)
            }
        }
    }

    fn register_tunnel_inner(
        &mut self,
        req: &TunnelRequest,
        client: Arc<dyn ConsumerClient>,
        closure: u64,
    ) -> Result<Handle, OmxError> {
        let record = match (req.service_name.as_deref(), req.service_id) {
            (Some(name), _) => self.directory.resolve_by_name(name),
            (None, Some(id)) => self.directory.resolve_by_id(id),
            (None, None) => {
                return Err(OmxError::InvalidUsage(
                    "tunnel request needs a service name or id".into(),
                ))
            }
        };

        let mut item = Item {
            role: ItemRole::Tunnel { mux: TunnelMux::new() },
            domain: req.domain,
            name: req.name.clone(),
            service_name: req.service_name.clone(),
            channel: None,
            stream_id: 0,
            private_stream: true,
            streaming: true,
            closure,
            client,
        };

        let record = match record {
            Some(record) => record,
            None => {
                let handle = self.registry.insert(item);
                let status = ClosedStatus {
                    name: req.name.clone(),
                    service_name: req.service_name.clone(),
                    domain: req.domain,
                    stream_id: 0,
                    private_stream: true,
                    state: StreamState::closed("service not found"),
                };
                self.schedule_closed(handle, status);
                return Ok(handle);
            }
        };

        let stream_id = self.transport.next_stream_id(record.channel);
        item.channel = Some(record.channel);
        item.stream_id = stream_id;
        let handle = self.registry.insert(item);
        self.registry.route(record.channel, stream_id, handle);

        if let Err(err) = self.transport.open_tunnel(record.channel, req, stream_id) {
            self.registry.remove(handle);
            return Err(OmxError::InvalidUsage(format!(
                "tunnel open failed on {}: {}",
                err.channel, err.text
            )));
        }
        debug!(
            "[tunnel] open '{}' on {} stream {}",
            req.name, record.channel, stream_id
        );
        Ok(handle)
    }

    fn register_sub(
        &mut self,
        parent: Handle,
        req: &ItemRequest,
        client: Arc<dyn ConsumerClient>,
        closure: u64,
    ) -> Result<Handle, OmxError> {
        let (channel, tunnel_stream_id) = match self.registry.get(parent) {
            Some(item) if item.is_tunnel() => match item.channel {
                Some(channel) => (channel, item.stream_id),
                None => {
                    return Err(OmxError::InvalidUsage(
                        "tunnel stream is not routed".into(),
                    ))
                }
            },
            // A sub-item parent must be a live tunnel stream; anything else
            // is a bad handle.
            Some(_) | None => return Err(OmxError::InvalidHandle(parent.as_u64())),
        };

        // Sub-items route through their tunnel; naming a service on one
        // cannot be honored and ends the stream before it opens.
        if req.service_name.is_some() || req.service_id.is_some() {
            let role = ItemRole::Sub { parent, sub_stream_id: 0 };
            let handle = self
                .registry
                .insert(Item::from_request(req, role, client, closure));
            self.schedule_closed_status(
                handle,
                req,
                "service identification is not supported on a sub stream",
            );
            return Ok(handle);
        }

        let role = ItemRole::Sub { parent, sub_stream_id: 0 };
        let mut item = Item::from_request(req, role, client, closure);
        item.channel = Some(channel);
        let handle = self.registry.insert(item);

        let assign = match self.registry.get_mut(parent) {
            Some(parent_item) => match &mut parent_item.role {
                ItemRole::Tunnel { mux } => {
                    if req.stream_id != 0 {
                        mux.add_at(handle, req.stream_id).map(|_| req.stream_id)
                    } else {
                        Ok(mux.add(handle))
                    }
                }
                _ => {
                    self.registry.remove(handle);
                    return Err(OmxError::InvalidHandle(parent.as_u64()));
                }
            },
            None => {
                self.registry.remove(handle);
                return Err(OmxError::InvalidHandle(parent.as_u64()));
            }
        };

        let sub_stream_id = match assign {
            Ok(id) => id,
            Err(SubIdError::Reserved(id)) => {
                self.registry.remove(handle);
                return Err(OmxError::InvalidUsage(format!(
                    "sub-stream id {id} is below the tunnel's starting id"
                )));
            }
            Err(SubIdError::InUse(id)) => {
                self.registry.remove(handle);
                return Err(OmxError::InvalidUsage(format!(
                    "sub-stream id {id} already in use"
                )));
            }
        };

        if let Some(item) = self.registry.get_mut(handle) {
            item.stream_id = sub_stream_id;
            item.role = ItemRole::Sub { parent, sub_stream_id };
        }

        let sub_msg = SubStreamMsg::Request {
            stream_id: sub_stream_id,
            domain: req.domain,
            name: req.name.clone(),
            streaming: req.streaming,
            private_stream: req.private_stream,
        };
        if let Err(err) = self.submit_sub_msg(channel, tunnel_stream_id, &sub_msg) {
            self.drop_sub_item(handle);
            return Err(err);
        }
        Ok(handle)
    }

    fn reissue_inner(&mut self, handle: Handle, req: &ItemRequest) -> Result<(), OmxError> {
        let (is_batch, is_tunnel, sub, channel, stream_id, domain, name, service_name) =
            match self.registry.get(handle) {
                Some(item) => (
                    item.is_batch_parent(),
                    item.is_tunnel(),
                    item.sub_parent().map(|p| (p, item.stream_id)),
                    item.channel,
                    item.stream_id,
                    item.domain,
                    item.name.clone(),
                    item.service_name.clone(),
                ),
                None => return Err(OmxError::InvalidHandle(handle.as_u64())),
            };

        if is_batch {
            return Err(OmxError::InvalidUsage(
                "a batch stream cannot be reissued; reissue its items".into(),
            ));
        }
        if is_tunnel {
            return Err(OmxError::InvalidUsage(
                "a tunnel stream cannot be reissued".into(),
            ));
        }

        if let Some((parent, sub_stream_id)) = sub {
            let (channel, tunnel_stream_id) = self.sub_route(parent)?;
            let msg = SubStreamMsg::Request {
                stream_id: sub_stream_id,
                domain,
                name: if req.name.is_empty() { name } else { req.name.clone() },
                streaming: req.streaming,
                private_stream: req.private_stream,
            };
            return self.submit_sub_msg(channel, tunnel_stream_id, &msg);
        }

        if domain == DomainType::Login {
            // Login reissue fans out like the original open.
            for channel in self.login.channels() {
                let msg = OutboundMsg::Request {
                    stream_id: LOGIN_STREAM_ID,
                    domain,
                    name: name.clone(),
                    service_name: None,
                    streaming: true,
                    private_stream: false,
                    batch_names: Vec::new(),
                };
                self.transport.submit(channel, &msg).map_err(|err| {
                    OmxError::InvalidUsage(format!(
                        "login reissue failed on {}: {}",
                        err.channel, err.text
                    ))
                })?;
            }
            return Ok(());
        }

        let channel = channel.ok_or_else(|| {
            OmxError::InvalidUsage("stream is not routed to a channel".into())
        })?;
        let msg = OutboundMsg::Request {
            stream_id,
            domain,
            name: if req.name.is_empty() { name } else { req.name.clone() },
            service_name,
            streaming: req.streaming,
            private_stream: req.private_stream,
            batch_names: Vec::new(),
        };
        self.transport.submit(channel, &msg).map_err(|err| {
            OmxError::InvalidUsage(format!("reissue failed on {}: {}", err.channel, err.text))
        })
    }

    /// Shared body of `submit_post` / `submit_generic`.
    fn submit_payload(
        &mut self,
        handle: Handle,
        domain_override: Option<DomainType>,
        payload: &[u8],
        is_post: bool,
    ) -> Result<(), OmxError> {
        let (is_batch, is_tunnel, sub, channel, stream_id, item_domain) =
            match self.registry.get(handle) {
                Some(item) => (
                    item.is_batch_parent(),
                    item.is_tunnel(),
                    item.sub_parent().map(|p| (p, item.stream_id)),
                    item.channel,
                    item.stream_id,
                    item.domain,
                ),
                None => return Err(OmxError::InvalidHandle(handle.as_u64())),
            };

        if is_batch {
            return Err(OmxError::InvalidUsage(
                "cannot submit on a batch stream".into(),
            ));
        }
        if is_tunnel {
            return Err(OmxError::InvalidUsage(
                "cannot submit directly on a tunnel stream; use its sub-items".into(),
            ));
        }
        let domain = domain_override.unwrap_or(item_domain);

        if let Some((parent, sub_stream_id)) = sub {
            let (channel, tunnel_stream_id) = self.sub_route(parent)?;
            let msg = if is_post {
                SubStreamMsg::Post { stream_id: sub_stream_id, domain, payload: payload.to_vec() }
            } else {
                SubStreamMsg::Generic { stream_id: sub_stream_id, domain, payload: payload.to_vec() }
            };
            return self.submit_sub_msg(channel, tunnel_stream_id, &msg);
        }

        if item_domain == DomainType::Login {
            // On-stream posting rides the login stream of every channel.
            for channel in self.login.channels() {
                let msg = if is_post {
                    OutboundMsg::Post { stream_id: LOGIN_STREAM_ID, domain, payload: payload.to_vec() }
                } else {
                    OutboundMsg::Generic { stream_id: LOGIN_STREAM_ID, domain, payload: payload.to_vec() }
                };
                self.transport.submit(channel, &msg).map_err(|err| {
                    OmxError::InvalidUsage(format!(
                        "login submit failed on {}: {}",
                        err.channel, err.text
                    ))
                })?;
            }
            return Ok(());
        }

        let channel = channel.ok_or_else(|| {
            OmxError::InvalidUsage("stream is not routed to a channel".into())
        })?;
        let msg = if is_post {
            OutboundMsg::Post { stream_id, domain, payload: payload.to_vec() }
        } else {
            OutboundMsg::Generic { stream_id, domain, payload: payload.to_vec() }
        };
        self.transport.submit(channel, &msg).map_err(|err| {
            OmxError::InvalidUsage(format!("submit failed on {}: {}", err.channel, err.text))
        })
    }

    fn unregister_inner(&mut self, handle: Handle) -> Result<(), OmxError> {
        enum Plan {
            Single { channel: Option<ChannelId>, stream_id: i32, domain: DomainType },
            BatchChild { parent: Handle, channel: Option<ChannelId>, stream_id: i32, domain: DomainType },
            Tunnel { channel: Option<ChannelId>, stream_id: i32, subs: Vec<Handle> },
            Sub { parent: Handle, sub_stream_id: i32, domain: DomainType },
            Login,
        }

        let plan = {
            let item = match self.registry.get(handle) {
                Some(item) => item,
                None => return Err(OmxError::InvalidHandle(handle.as_u64())),
            };
            debug!("[item] unregister {} ({})", handle, item.role.label());
            match &item.role {
                ItemRole::Single | ItemRole::Directory | ItemRole::Dictionary => Plan::Single {
                    channel: item.channel,
                    stream_id: item.stream_id,
                    domain: item.domain,
                },
                ItemRole::BatchParent { .. } => {
                    return Err(OmxError::InvalidUsage(
                        "a batch stream cannot be closed directly; close its items".into(),
                    ));
                }
                ItemRole::BatchChild { parent } => Plan::BatchChild {
                    parent: *parent,
                    channel: item.channel,
                    stream_id: item.stream_id,
                    domain: item.domain,
                },
                ItemRole::Tunnel { mux } => Plan::Tunnel {
                    channel: item.channel,
                    stream_id: item.stream_id,
                    subs: mux.live().into_iter().map(|(_, h)| h).collect(),
                },
                ItemRole::Sub { parent, sub_stream_id } => Plan::Sub {
                    parent: *parent,
                    sub_stream_id: *sub_stream_id,
                    domain: item.domain,
                },
                ItemRole::Login => Plan::Login,
            }
        };

        match plan {
            Plan::Single { channel, stream_id, domain } => {
                self.close_stream(channel, stream_id, domain);
                self.drop_item(handle);
            }
            Plan::BatchChild { parent, channel, stream_id, domain } => {
                self.close_stream(channel, stream_id, domain);
                self.drop_item(handle);
                self.decrement_batch(parent);
            }
            Plan::Tunnel { channel, stream_id, subs } => {
                for sub in subs {
                    self.drop_item(sub);
                }
                if let Some(channel) = channel {
                    if let Err(err) = self.transport.close_tunnel(channel, stream_id) {
                        warn!("[tunnel] close failed on {}: {}", err.channel, err.text);
                    }
                }
                self.drop_item(handle);
            }
            Plan::Sub { parent, sub_stream_id, domain } => {
                if sub_stream_id != 0 {
                    if let Ok((channel, tunnel_stream_id)) = self.sub_route(parent) {
                        let close = SubStreamMsg::Close { stream_id: sub_stream_id, domain };
                        if let Err(err) = self.submit_sub_msg(channel, tunnel_stream_id, &close) {
                            warn!("[tunnel] sub close failed: {err}");
                        }
                    }
                }
                self.drop_sub_item(handle);
            }
            Plan::Login => {
                // Remove-only: the login stream outlives any one login item
                // and closes when the engine shuts down.
                self.login.remove_item(handle);
                self.drop_item(handle);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound routing
    // -----------------------------------------------------------------------

    fn route_event(&mut self, event: crate::transport::TransportEvent) {
        use crate::transport::TransportEvent as Ev;
        match event {
            Ev::Msg { channel, stream_id, msg } => {
                if stream_id == LOGIN_STREAM_ID {
                    self.route_login_msg(channel, &msg);
                } else {
                    self.route_item_msg(channel, stream_id, &msg);
                }
            }
            Ev::TunnelMsg { channel, tunnel_stream_id, sub_stream_id, msg } => {
                self.route_tunnel_msg(channel, tunnel_stream_id, sub_stream_id, &msg);
            }
            Ev::TunnelStatus { channel, tunnel_stream_id, state } => {
                self.route_tunnel_status(channel, tunnel_stream_id, state);
            }
            Ev::LoginEstablished { channel } => self.on_login_established(channel),
        }
    }

    fn route_item_msg(&mut self, channel: ChannelId, stream_id: i32, msg: &ItemMsg) {
        let Some(handle) = self.registry.lookup_route(channel, stream_id) else {
            debug!("[engine] unroutable message on {} stream {}", channel, stream_id);
            return;
        };
        let Some((client, event)) = self.client_and_event(handle) else {
            return;
        };
        deliver(&client, msg, &event);

        if stream_ends(msg) {
            let parent = self.registry.get(handle).and_then(|i| i.batch_parent());
            self.drop_item(handle);
            if let Some(parent) = parent {
                self.decrement_batch(parent);
            }
        }
    }

    /// Login messages fan in to every registered login item. A non-open
    /// aggregate state means the channel's session is gone: every item
    /// routed to that channel is removed with it.
    fn route_login_msg(&mut self, channel: ChannelId, msg: &ItemMsg) {
        let ends = msg.state.as_ref().is_some_and(|s| !s.is_open());
        for handle in self.login.items() {
            let Some((client, event)) = self.client_and_event(handle) else {
                continue;
            };
            deliver(&client, msg, &event);
        }
        if ends {
            warn!("[login] stream ended on {}, purging its items", channel);
            self.login.remove_channel(channel);
            for handle in self.registry.handles() {
                let on_channel = self
                    .registry
                    .get(handle)
                    .is_some_and(|item| item.channel == Some(channel));
                if on_channel {
                    self.drop_item(handle);
                }
            }
            if self.login.channels().is_empty() {
                for handle in self.login.items() {
                    self.login.remove_item(handle);
                    self.drop_item(handle);
                }
            }
        }
    }

    fn route_tunnel_msg(
        &mut self,
        channel: ChannelId,
        tunnel_stream_id: i32,
        sub_stream_id: i32,
        msg: &ItemMsg,
    ) {
        let Some(tunnel) = self.registry.lookup_route(channel, tunnel_stream_id) else {
            debug!("[tunnel] unroutable sub message on {} stream {}", channel, tunnel_stream_id);
            return;
        };
        let sub = match self.registry.get(tunnel) {
            Some(item) => match &item.role {
                ItemRole::Tunnel { mux } => mux.get(sub_stream_id),
                _ => None,
            },
            None => None,
        };
        let Some(sub) = sub else {
            debug!("[tunnel] no sub-item at id {}", sub_stream_id);
            return;
        };
        let Some((client, event)) = self.client_and_event(sub) else {
            return;
        };
        deliver(&client, msg, &event);

        if stream_ends(msg) {
            self.drop_sub_item(sub);
        }
    }

    fn route_tunnel_status(&mut self, channel: ChannelId, tunnel_stream_id: i32, state: StreamState) {
        let Some(tunnel) = self.registry.lookup_route(channel, tunnel_stream_id) else {
            return;
        };
        let msg = ItemMsg::status(DomainType::System, state.clone());
        let Some((client, event)) = self.client_and_event(tunnel) else {
            return;
        };
        deliver(&client, &msg, &event);

        if !state.is_open() {
            let subs = match self.registry.get(tunnel) {
                Some(item) => match &item.role {
                    ItemRole::Tunnel { mux } => mux.live(),
                    _ => Vec::new(),
                },
                None => Vec::new(),
            };
            // The tunnel died underneath its sub-items; each one gets the
            // terminal state before removal.
            for (_, sub) in subs {
                if let Some((client, event)) = self.client_and_event(sub) {
                    let sub_msg = ItemMsg::status(DomainType::System, state.clone());
                    deliver(&client, &sub_msg, &event);
                }
                self.drop_item(sub);
            }
            self.drop_item(tunnel);
        }
    }

    fn on_login_established(&mut self, channel: ChannelId) {
        self.login.add_channel(channel);
        debug!("[login] channel {} established", channel);
        // Late channels replay every registered login interest.
        for handle in self.login.items() {
            let name = match self.registry.get(handle) {
                Some(item) => item.name.clone(),
                None => continue,
            };
            let msg = OutboundMsg::Request {
                stream_id: LOGIN_STREAM_ID,
                domain: DomainType::Login,
                name,
                service_name: None,
                streaming: true,
                private_stream: false,
                batch_names: Vec::new(),
            };
            if let Err(err) = self.transport.submit(channel, &msg) {
                warn!("[login] replay failed on {}: {}", err.channel, err.text);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Deferred actions
    // -----------------------------------------------------------------------

    fn schedule_closed_status(&mut self, handle: Handle, req: &ItemRequest, text: &str) {
        let status = ClosedStatus {
            name: req.name.clone(),
            service_name: req.service_name.clone(),
            domain: req.domain,
            stream_id: req.stream_id,
            private_stream: req.private_stream,
            state: StreamState::closed(text),
        };
        self.schedule_closed(handle, status);
    }

    fn schedule_closed(&mut self, handle: Handle, status: ClosedStatus) {
        debug!("[item] deferring closed status for {}: {}", handle, status.state.text);
        let token = self.timers.schedule(
            Duration::from_millis(self.config.closed_status_delay_ms),
            TimerAction::DeliverClosedStatus { handle, status },
        );
        self.pending_close.insert(handle, token);
    }

    fn deliver_closed_status(&mut self, handle: Handle, status: ClosedStatus) {
        // The item may have been unregistered before the deadline.
        let Some((client, event)) = self.client_and_event(handle) else {
            return;
        };
        let msg = ItemMsg::status(status.domain, status.state);
        deliver(&client, &msg, &event);

        let parent = self.registry.get(handle).and_then(|i| i.batch_parent());
        self.drop_item(handle);
        if let Some(parent) = parent {
            self.decrement_batch(parent);
        }
    }

    fn deliver_login_ready(&mut self, handle: Handle) {
        let Some((client, event)) = self.client_and_event(handle) else {
            return;
        };
        let msg = ItemMsg::refresh(
            DomainType::Login,
            StreamState::open_ok("login accepted"),
            true,
        );
        deliver(&client, &msg, &event);
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn resolve_service(&self, req: &ItemRequest) -> Result<Option<omx_core::ServiceRecord>, OmxError> {
        match (req.service_name.as_deref(), req.service_id) {
            (Some(name), _) => Ok(self.directory.resolve_by_name(name)),
            (None, Some(id)) => Ok(self.directory.resolve_by_id(id)),
            (None, None) => Err(OmxError::InvalidUsage(
                "request needs a service name or id".into(),
            )),
        }
    }

    fn open_on_channel(
        &mut self,
        handle: Handle,
        req: &ItemRequest,
        channel: ChannelId,
    ) -> Result<(), OmxError> {
        let stream_id = if req.stream_id != 0 {
            req.stream_id
        } else {
            self.transport.next_stream_id(channel)
        };
        if let Some(item) = self.registry.get_mut(handle) {
            item.channel = Some(channel);
            item.stream_id = stream_id;
        }
        self.registry.route(channel, stream_id, handle);

        let msg = OutboundMsg::Request {
            stream_id,
            domain: req.domain,
            name: req.name.clone(),
            service_name: req.service_name.clone(),
            streaming: req.streaming,
            private_stream: req.private_stream,
            batch_names: Vec::new(),
        };
        if let Err(err) = self.transport.submit(channel, &msg) {
            self.registry.remove(handle);
            return Err(OmxError::InvalidUsage(format!(
                "open failed on {}: {}",
                err.channel, err.text
            )));
        }
        Ok(())
    }

    fn close_stream(&mut self, channel: Option<ChannelId>, stream_id: i32, domain: DomainType) {
        if let Some(channel) = channel {
            let close = OutboundMsg::Close { stream_id, domain };
            if let Err(err) = self.transport.submit(channel, &close) {
                warn!("[item] close failed on {}: {}", err.channel, err.text);
            }
        }
    }

    fn send_login_close(&mut self) {
        let mut sent = 0usize;
        for channel in self.login.channels() {
            let close = OutboundMsg::Close {
                stream_id: LOGIN_STREAM_ID,
                domain: DomainType::Login,
            };
            match self.transport.submit(channel, &close) {
                Ok(()) => sent += 1,
                Err(err) => warn!("[login] close failed on {}: {}", err.channel, err.text),
            }
        }
        debug!("[login] close sent on {sent} channels");
    }

    /// Remove an item and cancel its pending deferred close.
    fn drop_item(&mut self, handle: Handle) {
        if let Some(token) = self.pending_close.remove(&handle) {
            self.timers.cancel(token);
        }
        self.registry.remove(handle);
    }

    /// Remove a sub-item, freeing its slot in the parent tunnel.
    fn drop_sub_item(&mut self, handle: Handle) {
        let parent_and_id = self.registry.get(handle).and_then(|item| match item.role {
            ItemRole::Sub { parent, sub_stream_id } => Some((parent, sub_stream_id)),
            _ => None,
        });
        // Id 0 means the sub-item never got a slot (deferred close).
        if let Some((parent, sub_stream_id)) = parent_and_id.filter(|(_, id)| *id != 0) {
            if let Some(parent_item) = self.registry.get_mut(parent) {
                if let ItemRole::Tunnel { mux } = &mut parent_item.role {
                    if mux.remove(sub_stream_id).is_none() {
                        error!("[tunnel] sub-item slot {} already empty", sub_stream_id);
                    }
                }
            }
        }
        self.drop_item(handle);
    }

    fn decrement_batch(&mut self, parent: Handle) {
        let destroy = match self.registry.get_mut(parent) {
            Some(item) => match &mut item.role {
                ItemRole::BatchParent { live_children, .. } => {
                    *live_children = live_children.saturating_sub(1);
                    *live_children == 0
                }
                _ => false,
            },
            None => false,
        };
        if destroy {
            self.drop_item(parent);
        }
    }

    fn sub_route(&self, parent: Handle) -> Result<(ChannelId, i32), OmxError> {
        match self.registry.get(parent) {
            Some(item) if item.is_tunnel() => match item.channel {
                Some(channel) => Ok((channel, item.stream_id)),
                None => Err(OmxError::InvalidUsage("tunnel stream is not routed".into())),
            },
            Some(_) | None => Err(OmxError::InvalidHandle(parent.as_u64())),
        }
    }

    fn submit_sub_msg(
        &mut self,
        channel: ChannelId,
        tunnel_stream_id: i32,
        msg: &SubStreamMsg,
    ) -> Result<(), OmxError> {
        let bytes = encode_sub_msg(&self.codec, msg)
            .map_err(|e| OmxError::InvalidUsage(format!("sub-stream encode failed: {e}")))?;
        self.transport
            .submit_tunnel(channel, tunnel_stream_id, &bytes)
            .map_err(|err| {
                OmxError::InvalidUsage(format!(
                    "sub-stream submit failed on {}: {}",
                    err.channel, err.text
                ))
            })
    }

    fn client_and_event(&self, handle: Handle) -> Option<(Arc<dyn ConsumerClient>, ItemEvent)> {
        let item = self.registry.get(handle)?;
        Some((
            item.client.clone(),
            ItemEvent {
                handle,
                closure: item.closure,
                service_name: item.service_name.clone(),
            },
        ))
    }

    fn finish_handle(&self, result: Result<Handle, OmxError>) -> Result<Handle, OmxError> {
        match result {
            Ok(handle) => Ok(handle),
            Err(err) => match &self.error_client {
                Some(client) => {
                    notify_error(client, &err);
                    Ok(Handle::NONE)
                }
                None => Err(err),
            },
        }
    }

    fn finish_unit(&self, result: Result<(), OmxError>) -> Result<(), OmxError> {
        match result {
            Ok(()) => Ok(()),
            Err(err) => match &self.error_client {
                Some(client) => {
                    notify_error(client, &err);
                    Ok(())
                }
                None => Err(err),
            },
        }
    }
}

/// Whether this message terminates the stream: a non-open state, or a
/// complete snapshot refresh.
fn stream_ends(msg: &ItemMsg) -> bool {
    let Some(state) = &msg.state else {
        return false;
    };
    match state.stream {
        StreamStateKind::Closed | StreamStateKind::ClosedRecover | StreamStateKind::Redirected => {
            true
        }
        // A snapshot stream survives its partial refreshes and closes with
        // the completing one; on a status the state alone is terminal.
        StreamStateKind::NonStreaming => match msg.kind {
            MsgKind::Refresh => msg.complete,
            _ => true,
        },
        StreamStateKind::Open => false,
    }
}

fn deliver(client: &Arc<dyn ConsumerClient>, msg: &ItemMsg, event: &ItemEvent) {
    client.on_all(msg, event);
    match msg.kind {
        MsgKind::Refresh => client.on_refresh(msg, event),
        MsgKind::Update => client.on_update(msg, event),
        MsgKind::Status => client.on_status(msg, event),
        MsgKind::Generic => client.on_generic(msg, event),
        MsgKind::Ack => client.on_ack(msg, event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        ChannelTransport, FrameCodec, StaticDirectory, Submission, TransportEvent,
    };
    use omx_core::{DataState, ServiceRecord};
    use std::sync::Mutex;

    // -- fixtures ----------------------------------------------------------

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(MsgKind, u64)>>,
    }

    impl ConsumerClient for Recorder {
        fn on_all(&self, msg: &ItemMsg, event: &ItemEvent) {
            self.events.lock().unwrap().push((msg.kind, event.closure));
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<MsgKind> {
            self.events.lock().unwrap().iter().map(|(k, _)| *k).collect()
        }
    }

    #[derive(Default)]
    struct ErrorRecorder {
        texts: Mutex<Vec<String>>,
    }

    impl ErrorClient for ErrorRecorder {
        fn on_invalid_usage(&self, text: &str) {
            self.texts.lock().unwrap().push(text.to_string());
        }
        fn on_invalid_handle(&self, _handle: u64, text: &str) {
            self.texts.lock().unwrap().push(text.to_string());
        }
    }

    fn test_config() -> ConsumerConfig {
        ConsumerConfig {
            closed_status_delay_ms: 1,
            login_ready_delay_ms: 1,
            dispatch_timeout_ms: 1,
            ..ConsumerConfig::default()
        }
    }

    fn engine_with_services(
        services: Vec<ServiceRecord>,
    ) -> ConsumerEngine<ChannelTransport, StaticDirectory, FrameCodec> {
        ConsumerEngine::new(
            test_config(),
            ChannelTransport::new(64),
            StaticDirectory::new(services),
            FrameCodec,
        )
    }

    fn feed() -> Vec<ServiceRecord> {
        vec![ServiceRecord {
            name: "FEED".into(),
            service_id: 10,
            channel: ChannelId(1),
        }]
    }

    fn login_req() -> ItemRequest {
        let mut req = ItemRequest::market_price("user1", "FEED");
        req.domain = DomainType::Login;
        req.service_name = None;
        req
    }

    fn tick(engine: &mut ConsumerEngine<ChannelTransport, StaticDirectory, FrameCodec>) -> usize {
        engine.dispatch(Duration::from_millis(1))
    }

    fn wait_for_timers() {
        std::thread::sleep(Duration::from_millis(10));
    }

    // -- single items ------------------------------------------------------

    #[test]
    fn single_open_routes_and_delivers_updates() {
        let mut engine = engine_with_services(feed());
        let client = Arc::new(Recorder::default());
        let req = ItemRequest::market_price("EUR=", "FEED");
        let handle = engine
            .register_item(&req, client.clone(), 42, Handle::NONE)
            .unwrap();
        assert!(!handle.is_none());
        assert_eq!(engine.item_count(), 1);

        engine.transport.inject(TransportEvent::Msg {
            channel: ChannelId(1),
            stream_id: 5,
            msg: ItemMsg::update(DomainType::MarketPrice),
        });
        tick(&mut engine);

        let events = engine_events(&client);
        assert_eq!(events, &[(MsgKind::Update, 42)]);
    }

    fn engine_events(client: &Recorder) -> Vec<(MsgKind, u64)> {
        client.events.lock().unwrap().clone()
    }

    #[test]
    fn unknown_service_defers_closed_status() {
        let mut engine = engine_with_services(feed());
        let client = Arc::new(Recorder::default());
        let req = ItemRequest::market_price("EUR=", "NOSUCH");
        let handle = engine
            .register_item(&req, client.clone(), 0, Handle::NONE)
            .unwrap();

        // Registration itself succeeds; no callback yet.
        assert!(!handle.is_none());
        assert!(client.kinds().is_empty());
        assert_eq!(engine.item_count(), 1);

        wait_for_timers();
        tick(&mut engine);
        assert_eq!(client.kinds(), vec![MsgKind::Status]);
        assert_eq!(engine.item_count(), 0);

        // A second dispatch must not replay the status.
        tick(&mut engine);
        assert_eq!(client.kinds(), vec![MsgKind::Status]);
    }

    #[test]
    fn unregister_before_deadline_cancels_closed_status() {
        let mut engine = engine_with_services(feed());
        let client = Arc::new(Recorder::default());
        let req = ItemRequest::market_price("EUR=", "NOSUCH");
        let handle = engine
            .register_item(&req, client.clone(), 0, Handle::NONE)
            .unwrap();
        engine.unregister(handle).unwrap();

        wait_for_timers();
        tick(&mut engine);
        assert!(client.kinds().is_empty());
    }

    #[test]
    fn missing_service_identification_is_invalid_usage() {
        let mut engine = engine_with_services(feed());
        let mut req = ItemRequest::market_price("EUR=", "FEED");
        req.service_name = None;
        req.service_id = None;
        let err = engine
            .register_item(&req, Arc::new(Recorder::default()), 0, Handle::NONE)
            .unwrap_err();
        assert!(matches!(err, OmxError::InvalidUsage(_)));
        assert_eq!(engine.item_count(), 0);
    }

    #[test]
    fn non_open_status_removes_item() {
        let mut engine = engine_with_services(feed());
        let client = Arc::new(Recorder::default());
        let req = ItemRequest::market_price("EUR=", "FEED");
        let handle = engine
            .register_item(&req, client.clone(), 0, Handle::NONE)
            .unwrap();

        engine.transport.inject(TransportEvent::Msg {
            channel: ChannelId(1),
            stream_id: 5,
            msg: ItemMsg::status(DomainType::MarketPrice, StreamState::closed("gone")),
        });
        tick(&mut engine);

        assert_eq!(client.kinds(), vec![MsgKind::Status]);
        assert_eq!(engine.item_count(), 0);
        assert!(matches!(
            engine.unregister(handle),
            Err(OmxError::InvalidHandle(_))
        ));
    }

    #[test]
    fn complete_snapshot_refresh_removes_item() {
        let mut engine = engine_with_services(feed());
        let client = Arc::new(Recorder::default());
        let mut req = ItemRequest::market_price("EUR=", "FEED");
        req.streaming = false;
        engine
            .register_item(&req, client.clone(), 0, Handle::NONE)
            .unwrap();

        let state = StreamState {
            stream: StreamStateKind::NonStreaming,
            data: DataState::Ok,
            text: "snapshot".into(),
        };
        engine.transport.inject(TransportEvent::Msg {
            channel: ChannelId(1),
            stream_id: 5,
            msg: ItemMsg::refresh(DomainType::MarketPrice, state, true),
        });
        tick(&mut engine);

        assert_eq!(client.kinds(), vec![MsgKind::Refresh]);
        assert_eq!(engine.item_count(), 0);
    }

    #[test]
    fn partial_snapshot_refresh_keeps_item() {
        let mut engine = engine_with_services(feed());
        let client = Arc::new(Recorder::default());
        let mut req = ItemRequest::market_price("EUR=", "FEED");
        req.streaming = false;
        engine
            .register_item(&req, client.clone(), 0, Handle::NONE)
            .unwrap();

        let state = StreamState {
            stream: StreamStateKind::NonStreaming,
            data: DataState::Ok,
            text: "snapshot part".into(),
        };
        engine.transport.inject(TransportEvent::Msg {
            channel: ChannelId(1),
            stream_id: 5,
            msg: ItemMsg::refresh(DomainType::MarketPrice, state, false),
        });
        tick(&mut engine);

        // Incomplete refresh: delivered, but the stream stays up.
        assert_eq!(client.kinds(), vec![MsgKind::Refresh]);
        assert_eq!(engine.item_count(), 1);
    }

    #[test]
    fn non_streaming_status_removes_item() {
        let mut engine = engine_with_services(feed());
        let client = Arc::new(Recorder::default());
        engine
            .register_item(
                &ItemRequest::market_price("EUR=", "FEED"),
                client.clone(),
                0,
                Handle::NONE,
            )
            .unwrap();

        // A status carrying any non-open state ends the stream, the
        // non-streaming kind included.
        let state = StreamState {
            stream: StreamStateKind::NonStreaming,
            data: DataState::Ok,
            text: "winding down".into(),
        };
        engine.transport.inject(TransportEvent::Msg {
            channel: ChannelId(1),
            stream_id: 5,
            msg: ItemMsg::status(DomainType::MarketPrice, state),
        });
        tick(&mut engine);

        assert_eq!(client.kinds(), vec![MsgKind::Status]);
        assert_eq!(engine.item_count(), 0);
    }

    // -- handles -----------------------------------------------------------

    #[test]
    fn stale_handle_fails_without_mutation() {
        let mut engine = engine_with_services(feed());
        let client = Arc::new(Recorder::default());
        let a = engine
            .register_item(&ItemRequest::market_price("A", "FEED"), client.clone(), 0, Handle::NONE)
            .unwrap();
        engine.unregister(a).unwrap();

        let b = engine
            .register_item(&ItemRequest::market_price("B", "FEED"), client, 0, Handle::NONE)
            .unwrap();
        assert_ne!(a, b);

        // The stale handle is rejected and B survives.
        assert!(matches!(engine.unregister(a), Err(OmxError::InvalidHandle(_))));
        assert_eq!(engine.item_count(), 1);
    }

    // -- batches -----------------------------------------------------------

    #[test]
    fn batch_decomposes_into_sequential_children() {
        let mut engine = engine_with_services(feed());
        let client = Arc::new(Recorder::default());
        let mut req = ItemRequest::market_price("", "FEED");
        req.batch_names = vec!["A".into(), "B".into(), "C".into()];
        let parent = engine
            .register_item(&req, client.clone(), 0, Handle::NONE)
            .unwrap();

        // Parent plus three children.
        assert_eq!(engine.item_count(), 4);

        // Children answer on consecutive stream ids from the same channel.
        for (idx, stream_id) in [5, 6, 7].into_iter().enumerate() {
            engine.transport.inject(TransportEvent::Msg {
                channel: ChannelId(1),
                stream_id,
                msg: ItemMsg::update(DomainType::MarketPrice),
            });
            tick(&mut engine);
            assert_eq!(client.kinds().len(), idx + 1);
        }

        // Closing each child stream shrinks the group; the parent goes with
        // the last child, exactly once.
        for (closed, stream_id) in [5, 6, 7].into_iter().enumerate() {
            engine.transport.inject(TransportEvent::Msg {
                channel: ChannelId(1),
                stream_id,
                msg: ItemMsg::status(DomainType::MarketPrice, StreamState::closed("done")),
            });
            tick(&mut engine);
            if closed < 2 {
                assert!(engine.registry.contains(parent));
            }
        }
        assert_eq!(engine.item_count(), 0);
        assert!(matches!(
            engine.unregister(parent),
            Err(OmxError::InvalidHandle(_))
        ));
    }

    #[test]
    fn batch_submit_failure_unwinds_group() {
        let mut engine = engine_with_services(feed());
        engine.transport.fail_channel = Some((ChannelId(1), "write failed".into()));

        let mut req = ItemRequest::market_price("", "FEED");
        req.batch_names = vec!["A".into(), "B".into()];
        let err = engine
            .register_item(&req, Arc::new(Recorder::default()), 0, Handle::NONE)
            .unwrap_err();
        assert!(matches!(err, OmxError::InvalidUsage(_)));
        assert_eq!(engine.item_count(), 0);
    }

    #[test]
    fn batch_parent_rejects_close_reissue_and_submit() {
        let mut engine = engine_with_services(feed());
        let mut req = ItemRequest::market_price("", "FEED");
        req.batch_names = vec!["A".into(), "B".into()];
        let parent = engine
            .register_item(&req, Arc::new(Recorder::default()), 0, Handle::NONE)
            .unwrap();

        assert!(matches!(
            engine.unregister(parent),
            Err(OmxError::InvalidUsage(_))
        ));
        assert!(matches!(
            engine.reissue(parent, &ItemRequest::market_price("A", "FEED")),
            Err(OmxError::InvalidUsage(_))
        ));
        assert!(matches!(
            engine.submit_generic(parent, &GenericMsg { payload: vec![], domain: None }),
            Err(OmxError::InvalidUsage(_))
        ));
        // Nothing was mutated by the rejected calls.
        assert_eq!(engine.item_count(), 3);
    }

    // -- tunnels -----------------------------------------------------------

    fn open_tunnel(
        engine: &mut ConsumerEngine<ChannelTransport, StaticDirectory, FrameCodec>,
    ) -> Handle {
        let req = TunnelRequest::new("TNL", "FEED");
        engine
            .register_tunnel(&req, Arc::new(Recorder::default()), 0)
            .unwrap()
    }

    fn sub_req(name: &str) -> ItemRequest {
        let mut req = ItemRequest::market_price(name, "FEED");
        req.service_name = None;
        req
    }

    #[test]
    fn sub_items_reuse_freed_ids_first_fit() {
        let mut engine = engine_with_services(feed());
        let tunnel = open_tunnel(&mut engine);
        let client = Arc::new(Recorder::default());

        let a = engine
            .register_item(&sub_req("A"), client.clone(), 0, tunnel)
            .unwrap();
        let b = engine
            .register_item(&sub_req("B"), client.clone(), 0, tunnel)
            .unwrap();
        assert_ne!(a, b);

        engine.unregister(a).unwrap();
        let c = engine
            .register_item(&sub_req("C"), client.clone(), 7, tunnel)
            .unwrap();

        // C took A's freed slot: a message on sub-stream 5 reaches C.
        engine.transport.inject(TransportEvent::TunnelMsg {
            channel: ChannelId(1),
            tunnel_stream_id: 5,
            sub_stream_id: 5,
            msg: ItemMsg::update(DomainType::MarketPrice),
        });
        tick(&mut engine);
        assert_eq!(engine_events(&client), vec![(MsgKind::Update, 7)]);
        assert!(engine.unregister(c).is_ok());
    }

    #[test]
    fn requested_sub_id_is_validated() {
        let mut engine = engine_with_services(feed());
        let tunnel = open_tunnel(&mut engine);
        let client = Arc::new(Recorder::default());

        let mut req = sub_req("A");
        req.stream_id = 3;
        assert!(matches!(
            engine.register_item(&req, client.clone(), 0, tunnel),
            Err(OmxError::InvalidUsage(_))
        ));

        req.stream_id = 9;
        let a = engine
            .register_item(&req, client.clone(), 0, tunnel)
            .unwrap();
        assert!(!a.is_none());
        assert!(matches!(
            engine.register_item(&req, client, 0, tunnel),
            Err(OmxError::InvalidUsage(_))
        ));
    }

    #[test]
    fn sub_item_parent_must_be_a_live_tunnel() {
        let mut engine = engine_with_services(feed());
        let single = engine
            .register_item(
                &ItemRequest::market_price("A", "FEED"),
                Arc::new(Recorder::default()),
                0,
                Handle::NONE,
            )
            .unwrap();
        assert!(matches!(
            engine.register_item(&sub_req("B"), Arc::new(Recorder::default()), 0, single),
            Err(OmxError::InvalidHandle(_))
        ));
        assert!(matches!(
            engine.register_item(
                &sub_req("B"),
                Arc::new(Recorder::default()),
                0,
                Handle::from_u64(0xbeef)
            ),
            Err(OmxError::InvalidHandle(_))
        ));
    }

    #[test]
    fn sub_item_with_service_gets_deferred_closed_status() {
        let mut engine = engine_with_services(feed());
        let tunnel = open_tunnel(&mut engine);
        let client = Arc::new(Recorder::default());

        let req = ItemRequest::market_price("A", "FEED");
        let handle = engine.register_item(&req, client.clone(), 0, tunnel).unwrap();
        assert!(!handle.is_none());
        assert!(client.kinds().is_empty());

        wait_for_timers();
        tick(&mut engine);
        assert_eq!(client.kinds(), vec![MsgKind::Status]);
    }

    #[test]
    fn tunnel_rejects_reissue_and_direct_submit() {
        let mut engine = engine_with_services(feed());
        let tunnel = open_tunnel(&mut engine);
        assert!(matches!(
            engine.reissue(tunnel, &sub_req("A")),
            Err(OmxError::InvalidUsage(_))
        ));
        assert!(matches!(
            engine.submit_post(tunnel, &PostMsg { payload: vec![], domain: None }),
            Err(OmxError::InvalidUsage(_))
        ));
    }

    #[test]
    fn tunnel_teardown_notifies_sub_items() {
        let mut engine = engine_with_services(feed());
        let tunnel = open_tunnel(&mut engine);
        let client = Arc::new(Recorder::default());
        engine
            .register_item(&sub_req("A"), client.clone(), 1, tunnel)
            .unwrap();

        engine.transport.inject(TransportEvent::TunnelStatus {
            channel: ChannelId(1),
            tunnel_stream_id: 5,
            state: StreamState::closed("tunnel rejected"),
        });
        tick(&mut engine);

        assert_eq!(engine_events(&client), vec![(MsgKind::Status, 1)]);
        assert_eq!(engine.item_count(), 0);
    }

    #[test]
    fn tunnel_unregister_cascades_to_sub_items() {
        let mut engine = engine_with_services(feed());
        let tunnel = open_tunnel(&mut engine);
        engine
            .register_item(&sub_req("A"), Arc::new(Recorder::default()), 0, tunnel)
            .unwrap();
        engine
            .register_item(&sub_req("B"), Arc::new(Recorder::default()), 0, tunnel)
            .unwrap();
        assert_eq!(engine.item_count(), 3);

        engine.unregister(tunnel).unwrap();
        assert_eq!(engine.item_count(), 0);
        assert!(engine
            .transport
            .submissions
            .iter()
            .any(|s| matches!(s, Submission::TunnelClose(ChannelId(1), 5))));
    }

    // -- login -------------------------------------------------------------

    #[test]
    fn login_submit_fans_out_in_channel_order() {
        let mut engine = engine_with_services(feed());
        for ch in [1, 2, 3] {
            engine.transport.inject(TransportEvent::LoginEstablished {
                channel: ChannelId(ch),
            });
        }
        tick(&mut engine);

        let handle = engine
            .register_item(&login_req(), Arc::new(Recorder::default()), 0, Handle::NONE)
            .unwrap();
        engine.transport.submissions.clear();

        engine
            .submit_generic(handle, &GenericMsg { payload: vec![1, 2], domain: None })
            .unwrap();

        let targets: Vec<(u32, Vec<u8>)> = engine
            .transport
            .submissions
            .iter()
            .filter_map(|s| match s {
                Submission::Msg(ch, OutboundMsg::Generic { stream_id, payload, .. })
                    if *stream_id == LOGIN_STREAM_ID =>
                {
                    Some((ch.0, payload.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            targets,
            vec![(1, vec![1, 2]), (2, vec![1, 2]), (3, vec![1, 2])]
        );
    }

    #[test]
    fn login_open_aborts_on_first_channel_failure() {
        let mut engine = engine_with_services(feed());
        for ch in [1, 2, 3] {
            engine.transport.inject(TransportEvent::LoginEstablished {
                channel: ChannelId(ch),
            });
        }
        tick(&mut engine);
        engine.transport.fail_channel = Some((ChannelId(2), "write failed".into()));

        let err = engine
            .register_item(&login_req(), Arc::new(Recorder::default()), 0, Handle::NONE)
            .unwrap_err();
        assert!(matches!(err, OmxError::InvalidUsage(_)));
        assert_eq!(engine.item_count(), 0);
    }

    #[test]
    fn late_login_registration_gets_synthetic_refresh() {
        let mut engine = engine_with_services(feed());
        engine.transport.inject(TransportEvent::LoginEstablished {
            channel: ChannelId(1),
        });
        tick(&mut engine);

        let client = Arc::new(Recorder::default());
        engine
            .register_item(&login_req(), client.clone(), 0, Handle::NONE)
            .unwrap();

        wait_for_timers();
        tick(&mut engine);
        assert_eq!(client.kinds(), vec![MsgKind::Refresh]);
    }

    #[test]
    fn login_messages_fan_in_to_all_items() {
        // Long ready delay keeps the synthetic refresh out of this test.
        let config = ConsumerConfig {
            login_ready_delay_ms: 60_000,
            dispatch_timeout_ms: 1,
            ..ConsumerConfig::default()
        };
        let mut engine = ConsumerEngine::new(
            config,
            ChannelTransport::new(64),
            StaticDirectory::new(feed()),
            FrameCodec,
        );
        engine.transport.inject(TransportEvent::LoginEstablished {
            channel: ChannelId(1),
        });
        tick(&mut engine);

        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        engine.register_item(&login_req(), a.clone(), 0, Handle::NONE).unwrap();
        engine.register_item(&login_req(), b.clone(), 0, Handle::NONE).unwrap();

        engine.transport.inject(TransportEvent::Msg {
            channel: ChannelId(1),
            stream_id: LOGIN_STREAM_ID,
            msg: ItemMsg::status(DomainType::Login, StreamState::open_ok("ok")),
        });
        tick(&mut engine);
        assert_eq!(a.kinds(), vec![MsgKind::Status]);
        assert_eq!(b.kinds(), vec![MsgKind::Status]);
    }

    #[test]
    fn login_stream_end_purges_channel_items() {
        let mut engine = engine_with_services(feed());
        engine.transport.inject(TransportEvent::LoginEstablished {
            channel: ChannelId(1),
        });
        tick(&mut engine);

        let login_client = Arc::new(Recorder::default());
        engine
            .register_item(&login_req(), login_client.clone(), 0, Handle::NONE)
            .unwrap();
        engine
            .register_item(
                &ItemRequest::market_price("A", "FEED"),
                Arc::new(Recorder::default()),
                0,
                Handle::NONE,
            )
            .unwrap();
        assert_eq!(engine.item_count(), 2);

        engine.transport.inject(TransportEvent::Msg {
            channel: ChannelId(1),
            stream_id: LOGIN_STREAM_ID,
            msg: ItemMsg::status(DomainType::Login, StreamState::closed("session ended")),
        });
        tick(&mut engine);

        assert!(login_client.kinds().contains(&MsgKind::Status));
        assert_eq!(engine.item_count(), 0);
    }

    #[test]
    fn shutdown_closes_login_and_sweeps_items() {
        let mut engine = engine_with_services(feed());
        for ch in [1, 2] {
            engine.transport.inject(TransportEvent::LoginEstablished {
                channel: ChannelId(ch),
            });
        }
        tick(&mut engine);

        engine
            .register_item(&login_req(), Arc::new(Recorder::default()), 0, Handle::NONE)
            .unwrap();
        engine
            .register_item(
                &ItemRequest::market_price("A", "FEED"),
                Arc::new(Recorder::default()),
                0,
                Handle::NONE,
            )
            .unwrap();
        engine.transport.submissions.clear();

        engine.shutdown();
        assert_eq!(engine.item_count(), 0);

        let closes = engine
            .transport
            .submissions
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    Submission::Msg(_, OutboundMsg::Close { stream_id, .. })
                        if *stream_id == LOGIN_STREAM_ID
                )
            })
            .count();
        assert_eq!(closes, 2);
    }

    // -- dictionary --------------------------------------------------------

    #[test]
    fn dictionary_name_is_validated() {
        let mut engine = engine_with_services(feed());
        let mut req = ItemRequest::market_price("RWFBogus", "FEED");
        req.domain = DomainType::Dictionary;
        assert!(matches!(
            engine.register_item(&req, Arc::new(Recorder::default()), 0, Handle::NONE),
            Err(OmxError::InvalidUsage(_))
        ));

        req.name = "RWFFld".into();
        let handle = engine
            .register_item(&req, Arc::new(Recorder::default()), 0, Handle::NONE)
            .unwrap();
        assert!(!handle.is_none());
    }

    // -- error client mode -------------------------------------------------

    #[test]
    fn error_client_swallows_err_and_returns_none_handle() {
        let mut engine = engine_with_services(feed());
        let errors = Arc::new(ErrorRecorder::default());
        engine.set_error_client(errors.clone());

        let mut req = ItemRequest::market_price("EUR=", "FEED");
        req.service_name = None;
        req.service_id = None;
        let handle = engine
            .register_item(&req, Arc::new(Recorder::default()), 0, Handle::NONE)
            .unwrap();
        assert!(handle.is_none());
        assert_eq!(errors.texts.lock().unwrap().len(), 1);

        // Unit-returning surface follows the same mode.
        assert!(engine.unregister(Handle::from_u64(0xdead)).is_ok());
        assert_eq!(errors.texts.lock().unwrap().len(), 2);
    }

    // -- posting -----------------------------------------------------------

    #[test]
    fn post_and_generic_ride_the_item_stream() {
        let mut engine = engine_with_services(feed());
        let handle = engine
            .register_item(
                &ItemRequest::market_price("A", "FEED"),
                Arc::new(Recorder::default()),
                0,
                Handle::NONE,
            )
            .unwrap();
        engine.transport.submissions.clear();

        engine
            .submit_post(handle, &PostMsg { payload: vec![1], domain: None })
            .unwrap();
        engine
            .submit_generic(handle, &GenericMsg { payload: vec![2], domain: None })
            .unwrap();

        assert!(matches!(
            engine.transport.submissions[0],
            Submission::Msg(_, OutboundMsg::Post { stream_id: 5, .. })
        ));
        assert!(matches!(
            engine.transport.submissions[1],
            Submission::Msg(_, OutboundMsg::Generic { stream_id: 5, .. })
        ));
    }

    #[test]
    fn sub_item_payloads_go_through_the_tunnel() {
        let mut engine = engine_with_services(feed());
        let tunnel = open_tunnel(&mut engine);
        let sub = engine
            .register_item(&sub_req("A"), Arc::new(Recorder::default()), 0, tunnel)
            .unwrap();
        engine.transport.submissions.clear();

        engine
            .submit_generic(sub, &GenericMsg { payload: vec![9], domain: None })
            .unwrap();
        assert!(matches!(
            engine.transport.submissions[0],
            Submission::TunnelPayload(ChannelId(1), 5, _)
        ));
    }
}
