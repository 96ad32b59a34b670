//! The cluster: a table of authenticated connections, one per selected
//! server, plus the single choke point every command flows through.
//!
//! A cluster is driven from one thread. Callers obtain a [`ServerStream`]
//! through selection (`stream_for_reads` / `stream_for_writes`) or direct
//! addressing (`stream_for_server`), then execute commands against it. Node
//! failures remove the node from the table and bump its generation token;
//! streams minted before the bump fail [`Cluster::stream_valid`] and their
//! holders re-select.
use bson::{doc, Bson, Document};
use bytes::Bytes;
use fxhash::FxHashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use mongo_protocol::cluster_time::{self, ClusterTime};
use mongo_protocol::message::{
    LegacyRequest, OpMsg, OpReply, DEFAULT_MAX_BSON_OBJ_SIZE, DEFAULT_MAX_MSG_SIZE,
};
use mongo_protocol::read_preference::ReadPreference;
use mongo_protocol::scram::ScramCache;
use mongo_protocol::{Error, Result, ServerId};

use crate::auth;
use crate::config::ClientConfig;
use crate::monitoring::{
    CommandEventHandler, CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent,
};
use crate::tls::TlsOptions;
use crate::topology::{self, TopologyDescription, TopologyHandle};
use crate::transport::ConnectionManager;

mod command;
mod node;
mod server_stream;
mod session;
pub(crate) mod wire;

pub use command::CommandParts;
pub use node::ConnectionLimits;
pub use server_stream::ServerStream;
pub use session::ClientSession;

use node::Node;
use wire::{next_request_id, HelloReply};

/// How long to wait between selection attempts while the topology has no
/// matching server.
const SELECTION_RETRY_INTERVAL: Duration = Duration::from_millis(500);

pub struct Cluster {
    config: Arc<ClientConfig>,
    topology: TopologyHandle,
    connection_manager: Box<dyn ConnectionManager>,
    event_handler: Option<Box<dyn CommandEventHandler>>,
    tls_options: Option<TlsOptions>,
    operation_id: i64,
    request_id: i32,
    requires_auth: bool,
    nodes: FxHashMap<ServerId, Node>,
    generations: FxHashMap<ServerId, u32>,
    segments: Vec<Bytes>,
    scram_cache: ScramCache,
    cluster_time: Option<ClusterTime>,
    shut_down: bool,
}

impl Cluster {
    pub fn new(
        config: ClientConfig,
        topology: TopologyHandle,
        connection_manager: Box<dyn ConnectionManager>,
    ) -> Self {
        let tls_options = TlsOptions::from_config(&config);
        let requires_auth = config.credential().is_some();

        Cluster {
            config: Arc::new(config),
            topology,
            connection_manager,
            event_handler: None,
            tls_options,
            operation_id: 0,
            request_id: 0,
            requires_auth,
            nodes: Default::default(),
            generations: Default::default(),
            segments: Vec::new(),
            scram_cache: ScramCache::default(),
            cluster_time: None,
            shut_down: false,
        }
    }

    /// Installs a command-monitoring sink.
    #[must_use]
    pub fn with_event_handler(mut self, event_handler: Box<dyn CommandEventHandler>) -> Self {
        self.event_handler = Some(event_handler);
        self
    }

    /// Closes every connection. Idempotent; the cluster refuses work
    /// afterwards.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        debug!("Shutting down cluster");
        self.nodes.clear();
        self.shut_down = true;
    }

    /// Closes and removes one node and bumps its generation token, so every
    /// stream minted against the old connection becomes invalid.
    pub fn disconnect_node(&mut self, id: ServerId) {
        if self.nodes.remove(&id).is_some() {
            debug!(id, "Disconnected node");
        }
        *self.generations.entry(id).or_insert(0) += 1;
    }

    /// Selects a server for a read and resolves a stream to it, connecting
    /// on demand. Bounded by the configured server-selection timeout.
    pub fn stream_for_reads(
        &mut self,
        read_preference: &ReadPreference,
        session: Option<&ClientSession>,
    ) -> Result<ServerStream> {
        let pin = session.and_then(ClientSession::pinned_server);
        self.stream_with_selection(|topology| {
            topology::select_for_reads(topology, read_preference, pin)
        })
    }

    /// Selects a writable server and resolves a stream to it.
    pub fn stream_for_writes(&mut self, session: Option<&ClientSession>) -> Result<ServerStream> {
        let pin = session.and_then(ClientSession::pinned_server);
        self.stream_with_selection(|topology| topology::select_for_writes(topology, pin))
    }

    /// Resolves a stream to one specific server. With `reconnect_ok` false,
    /// an absent node is `NotConnected` instead of a new connection.
    pub fn stream_for_server(
        &mut self,
        id: ServerId,
        reconnect_ok: bool,
        session: Option<&ClientSession>,
    ) -> Result<ServerStream> {
        self.ensure_running()?;

        if let Some(pinned) = session.and_then(ClientSession::pinned_server) {
            if pinned != id {
                return Err(Error::ServerSelection(format!(
                    "Session is pinned to server {}, not {}",
                    pinned, id
                )));
            }
        }

        let snapshot = self.topology.snapshot();
        self.resolve_stream(id, reconnect_ok, &snapshot)
    }

    /// Whether a stream still refers to the live connection it was minted
    /// against.
    pub fn stream_valid(&self, stream: &ServerStream) -> bool {
        match self.nodes.get(&stream.server_id()) {
            Some(node) => node.generation() == stream.generation(),
            None => false,
        }
    }

    /// Runs one assembled command on the stream's connection: stamps session
    /// state, sends one `OP_MSG`, receives exactly one reply, and merges the
    /// returned cluster time back. Network and framing failures invalidate
    /// the node; server-reported failures do not.
    pub fn run_command_parts(
        &mut self,
        stream: &ServerStream,
        parts: &CommandParts,
        session: Option<&mut ClientSession>,
    ) -> Result<Document> {
        let request_id = next_request_id(&mut self.request_id);
        self.exchange_command(stream, parts, session, request_id)
    }

    /// The exchange itself, under a caller-drawn request id.
    fn exchange_command(
        &mut self,
        stream: &ServerStream,
        parts: &CommandParts,
        mut session: Option<&mut ClientSession>,
        request_id: i32,
    ) -> Result<Document> {
        self.ensure_running()?;
        let id = stream.server_id();
        if !self.stream_valid(stream) {
            return Err(Error::NotConnected(id));
        }

        let effective_time = cluster_time::later_of(stream.cluster_time(), self.cluster_time.as_ref());
        let body = parts.assemble(
            stream.topology_type(),
            stream.server_description().server_type(),
            session.as_deref(),
            effective_time,
        );

        let deadline = self.io_deadline();

        self.segments.clear();
        OpMsg::new(body).encode_into(request_id, &mut self.segments)?;
        let segments = std::mem::take(&mut self.segments);

        let outcome = match self.nodes.get_mut(&id) {
            Some(node) => node
                .transport_mut()
                .send(&segments, deadline)
                .and_then(|_| node.transport_mut().receive(deadline))
                .map(|frame| {
                    node.touch();
                    frame
                }),
            None => Err(Error::NotConnected(id)),
        };

        self.segments = segments;
        self.segments.clear();

        let frame = match outcome {
            Ok(frame) => frame,
            Err(error) => {
                if error.invalidates_node() {
                    self.disconnect_node(id);
                }
                return Err(error);
            }
        };

        let (header, reply) = match OpMsg::decode(&frame) {
            Ok(decoded) => decoded,
            Err(error) => {
                self.disconnect_node(id);
                return Err(Error::Protocol {
                    address: stream.address().to_string(),
                    message: error.to_string(),
                });
            }
        };

        if header.response_to != request_id {
            self.disconnect_node(id);
            return Err(Error::Protocol {
                address: stream.address().to_string(),
                message: format!(
                    "Reply to request {} arrived while awaiting {}",
                    header.response_to, request_id
                ),
            });
        }

        self.absorb_reply(&reply.body, session.as_deref_mut());
        wire::command_ok(reply.body)
    }

    /// [`Cluster::run_command_parts`] wrapped in command-monitoring events.
    /// One call is one logical operation: it draws a fresh operation id and
    /// reports start, outcome and duration to the installed sink.
    pub fn run_command_monitored(
        &mut self,
        stream: &ServerStream,
        parts: CommandParts,
        mut session: Option<&mut ClientSession>,
    ) -> Result<Document> {
        self.operation_id += 1;
        let operation_id = self.operation_id;
        let request_id = next_request_id(&mut self.request_id);

        if let Some(handler) = &self.event_handler {
            handler.command_started(CommandStartedEvent {
                operation_id,
                request_id,
                server_id: stream.server_id(),
                address: stream.address().to_string(),
                database: parts.db().to_string(),
                command_name: parts.command_name().to_string(),
            });
        }

        let started_at = Instant::now();
        let result = self.exchange_command(stream, &parts, session.as_deref_mut(), request_id);
        let duration = started_at.elapsed();

        if let Some(handler) = &self.event_handler {
            match &result {
                Ok(_) => handler.command_succeeded(CommandSucceededEvent {
                    operation_id,
                    request_id,
                    server_id: stream.server_id(),
                    address: stream.address().to_string(),
                    command_name: parts.command_name().to_string(),
                    duration,
                }),
                Err(error) => handler.command_failed(CommandFailedEvent {
                    operation_id,
                    request_id,
                    server_id: stream.server_id(),
                    address: stream.address().to_string(),
                    command_name: parts.command_name().to_string(),
                    duration,
                    failure: error.to_string(),
                }),
            }
        }

        result
    }

    /// Sends one legacy request on the stream's connection and returns the
    /// request id a reply, if any, will answer to.
    pub fn legacy_rpc_sendv_to_server(
        &mut self,
        stream: &ServerStream,
        request: &LegacyRequest,
    ) -> Result<i32> {
        self.ensure_running()?;
        let id = stream.server_id();
        if !self.stream_valid(stream) {
            return Err(Error::NotConnected(id));
        }

        let request_id = next_request_id(&mut self.request_id);
        let deadline = self.io_deadline();

        self.segments.clear();
        request.encode_into(request_id, &mut self.segments)?;
        let segments = std::mem::take(&mut self.segments);

        let outcome = match self.nodes.get_mut(&id) {
            Some(node) => node
                .transport_mut()
                .send(&segments, deadline)
                .map(|_| node.touch()),
            None => Err(Error::NotConnected(id)),
        };

        self.segments = segments;
        self.segments.clear();

        match outcome {
            Ok(()) => Ok(request_id),
            Err(error) => {
                if error.invalidates_node() {
                    self.disconnect_node(id);
                }
                Err(error)
            }
        }
    }

    /// Receives the `OP_REPLY` answering `request_id` on the stream's
    /// connection. A reply to anything else means the connection is
    /// desynchronized and the node is invalidated.
    pub fn try_recv(&mut self, stream: &ServerStream, request_id: i32) -> Result<OpReply> {
        self.ensure_running()?;
        let id = stream.server_id();
        if !self.stream_valid(stream) {
            return Err(Error::NotConnected(id));
        }
        let deadline = self.io_deadline();

        let outcome = match self.nodes.get_mut(&id) {
            Some(node) => node.transport_mut().receive(deadline).map(|frame| {
                node.touch();
                frame
            }),
            None => Err(Error::NotConnected(id)),
        };

        let frame = match outcome {
            Ok(frame) => frame,
            Err(error) => {
                if error.invalidates_node() {
                    self.disconnect_node(id);
                }
                return Err(error);
            }
        };

        let (header, reply) = match OpReply::decode(&frame) {
            Ok(decoded) => decoded,
            Err(error) => {
                self.disconnect_node(id);
                return Err(Error::Protocol {
                    address: stream.address().to_string(),
                    message: error.to_string(),
                });
            }
        };

        if header.response_to != request_id {
            self.disconnect_node(id);
            return Err(Error::Protocol {
                address: stream.address().to_string(),
                message: format!(
                    "Reply to request {} arrived while awaiting {}",
                    header.response_to, request_id
                ),
            });
        }

        Ok(reply)
    }

    /// Largest BSON document accepted by every live node.
    pub fn max_bson_obj_size(&self) -> i32 {
        self.nodes
            .values()
            .map(|node| node.limits().max_bson_obj_size)
            .min()
            .unwrap_or(DEFAULT_MAX_BSON_OBJ_SIZE)
    }

    /// Largest wire message accepted by every live node.
    pub fn max_msg_size(&self) -> i32 {
        self.nodes
            .values()
            .map(|node| node.limits().max_msg_size)
            .min()
            .unwrap_or(DEFAULT_MAX_MSG_SIZE)
    }

    /// Whether the node's idle time has passed the configured check
    /// interval, making the next stream resolution probe it.
    pub fn check_due(&self, id: ServerId) -> bool {
        self.nodes
            .get(&id)
            .map(|node| node.idle_time() >= self.config.check_interval())
            .unwrap_or(false)
    }

    #[inline]
    pub fn check_interval(&self) -> Duration {
        self.config.check_interval()
    }

    #[inline]
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_connected(&self, id: ServerId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Current generation token for a server id; zero when never connected.
    #[inline]
    pub fn generation(&self, id: ServerId) -> u32 {
        self.generations.get(&id).copied().unwrap_or(0)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down {
            Err(Error::General("Cluster has been shut down".into()))
        } else {
            Ok(())
        }
    }

    fn io_deadline(&self) -> Option<Instant> {
        self.config
            .socket_timeout()
            .map(|timeout| Instant::now() + timeout)
    }

    fn stream_with_selection(
        &mut self,
        mut select: impl FnMut(&TopologyDescription) -> Result<ServerId>,
    ) -> Result<ServerStream> {
        self.ensure_running()?;
        let deadline = Instant::now() + self.config.server_selection_timeout();

        loop {
            let snapshot = self.topology.snapshot();
            match select(&snapshot) {
                Ok(id) => return self.resolve_stream(id, true, &snapshot),
                Err(error) => {
                    if Instant::now() + SELECTION_RETRY_INTERVAL > deadline {
                        return Err(error);
                    }
                    debug!(%error, "No server selected; waiting for a topology change");
                    thread::sleep(SELECTION_RETRY_INTERVAL);
                }
            }
        }
    }

    /// Shared tail of every stream request: connect or liveness-check the
    /// node, then snapshot everything the stream carries.
    fn resolve_stream(
        &mut self,
        id: ServerId,
        reconnect_ok: bool,
        snapshot: &TopologyDescription,
    ) -> Result<ServerStream> {
        let description = snapshot.server(id).ok_or_else(|| {
            Error::ServerSelection(format!("Server {} is not in the topology", id))
        })?;

        if let Some(time) = snapshot.cluster_time() {
            cluster_time::merge(&mut self.cluster_time, time);
        }

        if !self.nodes.contains_key(&id) {
            if !reconnect_ok {
                return Err(Error::NotConnected(id));
            }
            self.connect_node(id, description.address())?;
        } else if self.check_due(id) {
            self.recheck_node(id)?;
        }

        let node = self.nodes.get(&id).ok_or(Error::NotConnected(id))?;
        Ok(ServerStream::new(
            snapshot.topology_type(),
            description.clone(),
            self.cluster_time.clone(),
            node.generation(),
            node.limits(),
        ))
    }

    /// Opens, handshakes and authenticates a connection, then inserts it
    /// into the table. Any failure on the way discards the candidate; it is
    /// never inserted.
    fn connect_node(&mut self, id: ServerId, address: &str) -> Result<()> {
        debug!(id, address, "Connecting node");
        let deadline = Some(Instant::now() + self.config.connect_timeout());
        let mut transport = self.connection_manager.connect(address, deadline)?;

        let config = self.config.clone();
        let hello_body = wire::build_hello(&config, config.credential());
        let reply = wire::run_command_on(
            &mut *transport,
            next_request_id(&mut self.request_id),
            "admin",
            hello_body,
            deadline,
        )?;
        let hello = HelloReply::parse(&reply);

        if let Some(time) = &hello.cluster_time {
            cluster_time::merge(&mut self.cluster_time, time);
        }

        if self.requires_auth {
            if let Some(credential) = config.credential() {
                auth::authenticate(
                    &mut *transport,
                    &mut self.request_id,
                    credential,
                    hello.sasl_supported_mechs.as_deref(),
                    self.tls_options.as_ref(),
                    &mut self.scram_cache,
                    deadline,
                )?;
            }
        }

        let generation = *self.generations.entry(id).or_insert(0);
        self.nodes.insert(
            id,
            Node::new(
                transport,
                address.to_string(),
                generation,
                ConnectionLimits::from_hello(&hello),
            ),
        );
        debug!(id, generation, "Node connected");
        Ok(())
    }

    /// Pings an idle node; a failed probe invalidates and transparently
    /// recreates it.
    fn recheck_node(&mut self, id: ServerId) -> Result<()> {
        let address = match self.nodes.get(&id) {
            Some(node) => node.address().to_string(),
            None => return Err(Error::NotConnected(id)),
        };

        let request_id = next_request_id(&mut self.request_id);
        let deadline = self.io_deadline();
        let outcome = match self.nodes.get_mut(&id) {
            Some(node) => wire::run_command_on(
                node.transport_mut(),
                request_id,
                "admin",
                doc! { "ping": 1 },
                deadline,
            ),
            None => return Err(Error::NotConnected(id)),
        };

        match outcome {
            Ok(_) => {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.touch();
                }
                Ok(())
            }
            Err(error) => {
                warn!(id, %error, "Liveness check failed; reconnecting");
                self.disconnect_node(id);
                self.connect_node(id, &address)
            }
        }
    }

    /// Folds a reply's gossip back into cluster and session state.
    fn absorb_reply(&mut self, reply: &Document, session: Option<&mut ClientSession>) {
        let incoming = reply
            .get_document("$clusterTime")
            .ok()
            .and_then(|document| ClusterTime::from_document(document).ok());

        if let Some(time) = &incoming {
            cluster_time::merge(&mut self.cluster_time, time);
        }

        if let Some(session) = session {
            if let Some(time) = &incoming {
                session.advance_cluster_time(time);
            }
            if let Some(Bson::Timestamp(timestamp)) = reply.get("operationTime") {
                session.advance_operation_time(*timestamp);
            }
        }
    }
}
