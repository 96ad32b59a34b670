//! Cluster behavior against scripted transports: node lifecycle,
//! generations, command execution, the legacy path and monitoring.
use bson::{doc, Document, Timestamp};
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mdrs::cluster::{ClientSession, Cluster, CommandParts};
use mdrs::cluster_time::ClusterTime;
use mdrs::config::{ClientConfig, ClientConfigBuilder, Credential};
use mdrs::error::Error;
use mdrs::message::legacy::QueryFlags;
use mdrs::message::{LegacyRequest, MessageHeader, OpCode, OpMsg, OpReply};
use mdrs::monitoring::{
    CommandEventHandler, CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent,
};
use mdrs::read_preference::ReadPreference;
use mdrs::topology::{
    ServerDescription, ServerType, TopologyDescription, TopologyHandle, TopologyType,
};
use mdrs::transport::{ConnectionManager, Transport};
use mdrs::Result;

/// One scripted server reply.
enum Reply {
    /// An `OP_MSG` reply answering the last sent request.
    Msg(Document),
    /// An `OP_MSG` reply answering the wrong request id.
    MsgWrongResponseTo(Document),
    /// An `OP_REPLY` answering the last sent request.
    Legacy(Vec<Document>),
    /// A connection-level failure.
    NetworkError,
}

#[derive(Default)]
struct ScriptState {
    replies: VecDeque<Reply>,
    /// Decoded bodies of every `OP_MSG` sent, in order.
    sent: Vec<Document>,
    /// Header of every message sent, in order.
    sent_headers: Vec<MessageHeader>,
    last_request_id: i32,
    connects: usize,
}

impl ScriptState {
    fn push(&mut self, reply: Reply) {
        self.replies.push_back(reply);
    }
}

struct ScriptedTransport {
    state: Rc<RefCell<ScriptState>>,
}

impl Transport for ScriptedTransport {
    fn send(&mut self, segments: &[Bytes], _deadline: Option<Instant>) -> Result<()> {
        let frame = segments.concat();
        let mut state = self.state.borrow_mut();

        let mut buf: &[u8] = &frame;
        let header = MessageHeader::decode(&mut buf)?;
        state.last_request_id = header.request_id;
        state.sent_headers.push(header);

        if header.op_code == OpCode::Msg {
            let (_, message) = OpMsg::decode(&frame)?;
            state.sent.push(message.body);
        }

        Ok(())
    }

    fn receive(&mut self, _deadline: Option<Instant>) -> Result<Bytes> {
        let mut state = self.state.borrow_mut();
        let request_id = state.last_request_id;
        let reply = state.replies.pop_front().expect("no scripted reply left");
        drop(state);

        let mut segments = Vec::new();
        match reply {
            Reply::Msg(body) => {
                OpMsg::new(body).encode_frame_into(99, request_id, &mut segments)?
            }
            Reply::MsgWrongResponseTo(body) => {
                OpMsg::new(body).encode_frame_into(99, request_id + 1000, &mut segments)?
            }
            Reply::Legacy(documents) => OpReply {
                documents,
                ..Default::default()
            }
            .encode_frame_into(99, request_id, &mut segments)?,
            Reply::NetworkError => {
                return Err(Error::Network {
                    address: "db:27017".into(),
                    message: "connection reset".into(),
                })
            }
        }
        Ok(segments.concat().into())
    }

    fn peer_address(&self) -> &str {
        "db:27017"
    }
}

struct ScriptedConnectionManager {
    state: Rc<RefCell<ScriptState>>,
}

impl ConnectionManager for ScriptedConnectionManager {
    fn connect(&self, _address: &str, _deadline: Option<Instant>) -> Result<Box<dyn Transport>> {
        self.state.borrow_mut().connects += 1;
        Ok(Box::new(ScriptedTransport {
            state: self.state.clone(),
        }))
    }
}

fn hello_reply() -> Document {
    doc! {
        "ok": 1.0,
        "maxBsonObjectSize": 2 * 1024 * 1024,
        "maxMessageSizeBytes": 4 * 1024 * 1024,
        "maxWriteBatchSize": 1000,
        "minWireVersion": 6,
        "maxWireVersion": 17,
    }
}

fn cluster_time(seconds: u32, increment: u32) -> ClusterTime {
    ClusterTime::new(
        Timestamp {
            time: seconds,
            increment,
        },
        doc! { "keyId": 0_i64 },
    )
}

fn single_topology() -> TopologyHandle {
    TopologyHandle::new(
        TopologyDescription::new(TopologyType::Single).with_server(ServerDescription::new(
            1,
            "db:27017".into(),
            ServerType::Standalone,
        )),
    )
}

fn default_config() -> ClientConfig {
    ClientConfigBuilder::new()
        .with_host("db:27017".into())
        .build()
}

fn new_cluster(config: ClientConfig) -> (Cluster, Rc<RefCell<ScriptState>>) {
    let state = Rc::new(RefCell::new(ScriptState::default()));
    let cluster = Cluster::new(
        config,
        single_topology(),
        Box::new(ScriptedConnectionManager {
            state: state.clone(),
        }),
    );
    (cluster, state)
}

#[test]
fn absent_node_without_reconnect_is_not_connected() {
    let (mut cluster, state) = new_cluster(default_config());

    match cluster.stream_for_server(1, false, None) {
        Err(Error::NotConnected(1)) => {}
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
    assert_eq!(cluster.node_count(), 0);
    assert_eq!(state.borrow().connects, 0);
}

#[test]
fn first_stream_connects_and_negotiates_limits() {
    let (mut cluster, state) = new_cluster(default_config());
    state.borrow_mut().push(Reply::Msg(hello_reply()));

    let stream = cluster.stream_for_writes(None).unwrap();

    assert!(cluster.is_connected(1));
    assert!(cluster.stream_valid(&stream));
    assert_eq!(cluster.generation(1), 0);
    assert_eq!(stream.server_id(), 1);
    assert_eq!(stream.max_bson_obj_size(), 2 * 1024 * 1024);
    assert_eq!(stream.max_write_batch_size(), 1000);
    assert_eq!(cluster.max_bson_obj_size(), 2 * 1024 * 1024);
    assert_eq!(cluster.max_msg_size(), 4 * 1024 * 1024);

    let state = state.borrow();
    assert_eq!(state.connects, 1);
    let hello = &state.sent[0];
    assert_eq!(hello.get_i32("hello").unwrap(), 1);
    assert_eq!(hello.get_str("$db").unwrap(), "admin");
    assert!(hello.get_document("client").unwrap().contains_key("driver"));
}

#[test]
fn reads_resolve_through_selection() {
    let (mut cluster, state) = new_cluster(default_config());
    state.borrow_mut().push(Reply::Msg(hello_reply()));

    // A single deployment serves any read preference from its one server.
    let stream = cluster
        .stream_for_reads(&ReadPreference::secondary(), None)
        .unwrap();
    assert_eq!(stream.server_id(), 1);
    assert_eq!(stream.topology_type(), TopologyType::Single);
    assert!(cluster.is_connected(1));
}

#[test]
fn request_ids_strictly_increase_across_commands() {
    let (mut cluster, state) = new_cluster(default_config());
    {
        let mut state = state.borrow_mut();
        state.push(Reply::Msg(hello_reply()));
        state.push(Reply::Msg(doc! { "ok": 1.0 }));
        state.push(Reply::Msg(doc! { "ok": 1.0 }));
    }

    let stream = cluster.stream_for_writes(None).unwrap();
    let parts = CommandParts::new("app", doc! { "ping": 1 });
    cluster.run_command_parts(&stream, &parts, None).unwrap();
    cluster.run_command_parts(&stream, &parts, None).unwrap();

    let state = state.borrow();
    let ids: Vec<i32> = state.sent_headers.iter().map(|header| header.request_id).collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|pair| pair[1] > pair[0]), "{:?}", ids);
}

#[test]
fn cluster_time_merge_is_idempotent() {
    let (mut cluster, state) = new_cluster(default_config());
    let later = cluster_time(100, 2);
    let earlier = cluster_time(99, 9);
    {
        let mut state = state.borrow_mut();
        state.push(Reply::Msg(hello_reply()));
        state.push(Reply::Msg(doc! {
            "ok": 1.0,
            "$clusterTime": later.to_document(),
            "operationTime": Timestamp { time: 100, increment: 2 },
        }));
        state.push(Reply::Msg(doc! {
            "ok": 1.0,
            "$clusterTime": later.to_document(),
        }));
        state.push(Reply::Msg(doc! {
            "ok": 1.0,
            "$clusterTime": earlier.to_document(),
        }));
    }

    let stream = cluster.stream_for_writes(None).unwrap();
    let parts = CommandParts::new("app", doc! { "ping": 1 });
    let mut session = ClientSession::new();

    cluster
        .run_command_parts(&stream, &parts, Some(&mut session))
        .unwrap();
    assert_eq!(cluster.cluster_time(), Some(&later));
    assert_eq!(session.cluster_time(), Some(&later));
    assert_eq!(
        session.operation_time(),
        Some(Timestamp { time: 100, increment: 2 })
    );

    // Replaying the same time and an earlier one changes nothing.
    cluster
        .run_command_parts(&stream, &parts, Some(&mut session))
        .unwrap();
    cluster
        .run_command_parts(&stream, &parts, Some(&mut session))
        .unwrap();
    assert_eq!(cluster.cluster_time(), Some(&later));
    assert_eq!(session.cluster_time(), Some(&later));

    // The session's time is stamped onto subsequent commands.
    let state = state.borrow();
    let last_sent = state.sent.last().unwrap();
    assert_eq!(
        last_sent.get_document("$clusterTime").unwrap(),
        &later.to_document()
    );
    assert!(last_sent.contains_key("lsid"));
}

#[test]
fn disconnect_invalidates_streams_and_bumps_generation() {
    let (mut cluster, state) = new_cluster(default_config());
    state.borrow_mut().push(Reply::Msg(hello_reply()));

    let stream = cluster.stream_for_writes(None).unwrap();
    let old_generation = cluster.generation(1);

    cluster.disconnect_node(1);
    assert!(!cluster.stream_valid(&stream));
    assert!(!cluster.is_connected(1));

    let parts = CommandParts::new("app", doc! { "ping": 1 });
    assert!(matches!(
        cluster.run_command_parts(&stream, &parts, None),
        Err(Error::NotConnected(1))
    ));

    // Reconnection mints a strictly newer generation.
    state.borrow_mut().push(Reply::Msg(hello_reply()));
    let fresh = cluster.stream_for_writes(None).unwrap();
    assert!(cluster.generation(1) > old_generation);
    assert!(cluster.stream_valid(&fresh));
    assert!(!cluster.stream_valid(&stream));
}

#[test]
fn network_failure_removes_the_node() {
    let (mut cluster, state) = new_cluster(default_config());
    {
        let mut state = state.borrow_mut();
        state.push(Reply::Msg(hello_reply()));
        state.push(Reply::NetworkError);
    }

    let stream = cluster.stream_for_writes(None).unwrap();
    let parts = CommandParts::new("app", doc! { "ping": 1 });

    assert!(matches!(
        cluster.run_command_parts(&stream, &parts, None),
        Err(Error::Network { .. })
    ));
    assert!(!cluster.is_connected(1));
    assert!(cluster.generation(1) > 0);
    assert!(!cluster.stream_valid(&stream));
}

#[test]
fn mismatched_response_to_is_a_protocol_error() {
    let (mut cluster, state) = new_cluster(default_config());
    {
        let mut state = state.borrow_mut();
        state.push(Reply::Msg(hello_reply()));
        state.push(Reply::MsgWrongResponseTo(doc! { "ok": 1.0 }));
    }

    let stream = cluster.stream_for_writes(None).unwrap();
    let parts = CommandParts::new("app", doc! { "ping": 1 });

    assert!(matches!(
        cluster.run_command_parts(&stream, &parts, None),
        Err(Error::Protocol { .. })
    ));
    assert!(!cluster.is_connected(1));
}

#[test]
fn server_errors_do_not_invalidate_the_node() {
    let (mut cluster, state) = new_cluster(default_config());
    {
        let mut state = state.borrow_mut();
        state.push(Reply::Msg(hello_reply()));
        state.push(Reply::Msg(doc! {
            "ok": 0.0,
            "code": 11600,
            "codeName": "InterruptedAtShutdown",
            "errmsg": "interrupted at shutdown",
        }));
    }

    let stream = cluster.stream_for_writes(None).unwrap();
    let parts = CommandParts::new("app", doc! { "ping": 1 });

    match cluster.run_command_parts(&stream, &parts, None) {
        Err(Error::Server { code, .. }) => assert_eq!(code, 11600),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(cluster.is_connected(1));
    assert!(cluster.stream_valid(&stream));
}

#[test]
fn idle_nodes_are_liveness_checked() {
    let config = ClientConfigBuilder::new()
        .with_host("db:27017".into())
        .with_check_interval(Duration::ZERO)
        .build();
    let (mut cluster, state) = new_cluster(config);
    {
        let mut state = state.borrow_mut();
        state.push(Reply::Msg(hello_reply()));
        state.push(Reply::Msg(doc! { "ok": 1.0 })); // ping reply
    }

    cluster.stream_for_writes(None).unwrap();
    assert!(cluster.check_due(1));
    cluster.stream_for_writes(None).unwrap();

    let state = state.borrow();
    assert_eq!(state.connects, 1);
    assert!(state
        .sent
        .iter()
        .any(|body| matches!(body.get_i32("ping"), Ok(1))));
}

#[test]
fn failed_liveness_check_recreates_the_node() {
    let config = ClientConfigBuilder::new()
        .with_host("db:27017".into())
        .with_check_interval(Duration::ZERO)
        .build();
    let (mut cluster, state) = new_cluster(config);
    {
        let mut state = state.borrow_mut();
        state.push(Reply::Msg(hello_reply()));
        state.push(Reply::NetworkError); // failed ping
        state.push(Reply::Msg(hello_reply())); // reconnect handshake
    }

    cluster.stream_for_writes(None).unwrap();
    let fresh = cluster.stream_for_writes(None).unwrap();

    assert_eq!(state.borrow().connects, 2);
    assert!(cluster.generation(1) > 0);
    assert!(cluster.stream_valid(&fresh));
}

#[test]
fn failed_authentication_never_inserts_the_node() {
    let config = ClientConfigBuilder::new()
        .with_host("db:27017".into())
        .with_credential(Credential::new("app".into(), Some("wrong".into())))
        .with_server_selection_timeout(Duration::from_millis(50))
        .build();
    let (mut cluster, state) = new_cluster(config);
    {
        let mut state = state.borrow_mut();
        let mut hello = hello_reply();
        hello.insert("saslSupportedMechs", vec!["SCRAM-SHA-256"]);
        state.push(Reply::Msg(hello));
        state.push(Reply::Msg(doc! {
            "ok": 0.0,
            "code": 18,
            "errmsg": "Authentication failed.",
        }));
    }

    assert!(matches!(
        cluster.stream_for_writes(None),
        Err(Error::Authentication { .. })
    ));
    assert_eq!(cluster.node_count(), 0);
    assert_eq!(cluster.generation(1), 0);

    let state = state.borrow();
    assert_eq!(state.sent[0].get_str("saslSupportedMechs").unwrap(), "admin.app");
    assert_eq!(state.sent[1].get_str("mechanism").unwrap(), "SCRAM-SHA-256");
}

#[test]
fn selection_times_out_on_an_empty_topology() {
    let state = Rc::new(RefCell::new(ScriptState::default()));
    let mut cluster = Cluster::new(
        ClientConfigBuilder::new()
            .with_server_selection_timeout(Duration::from_millis(50))
            .build(),
        TopologyHandle::default(),
        Box::new(ScriptedConnectionManager {
            state: state.clone(),
        }),
    );

    let started = Instant::now();
    assert!(matches!(
        cluster.stream_for_writes(None),
        Err(Error::ServerSelection(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(state.borrow().connects, 0);
}

#[test]
fn pinned_session_must_match_direct_addressing() {
    let (mut cluster, state) = new_cluster(default_config());
    state.borrow_mut().push(Reply::Msg(hello_reply()));

    let mut session = ClientSession::new();
    session.pin(7);
    assert!(matches!(
        cluster.stream_for_server(1, true, Some(&session)),
        Err(Error::ServerSelection(_))
    ));

    session.pin(1);
    assert!(cluster.stream_for_server(1, true, Some(&session)).is_ok());
}

#[test]
fn shutdown_is_idempotent_and_final() {
    let (mut cluster, state) = new_cluster(default_config());
    state.borrow_mut().push(Reply::Msg(hello_reply()));

    let stream = cluster.stream_for_writes(None).unwrap();
    cluster.shutdown();
    cluster.shutdown();

    assert_eq!(cluster.node_count(), 0);
    assert!(cluster.stream_for_writes(None).is_err());
    let parts = CommandParts::new("app", doc! { "ping": 1 });
    assert!(cluster.run_command_parts(&stream, &parts, None).is_err());
}

#[test]
fn legacy_round_trip_and_fire_and_forget() {
    let (mut cluster, state) = new_cluster(default_config());
    {
        let mut state = state.borrow_mut();
        state.push(Reply::Msg(hello_reply()));
        state.push(Reply::Legacy(vec![doc! { "x": 1 }, doc! { "x": 2 }]));
    }

    let stream = cluster.stream_for_writes(None).unwrap();

    // Unacknowledged write: send only, no reply expected.
    let insert = LegacyRequest::Insert {
        collection: "app.events".into(),
        flags: Default::default(),
        documents: vec![doc! { "x": 1 }],
    };
    assert!(!insert.expects_reply());
    let insert_id = cluster.legacy_rpc_sendv_to_server(&stream, &insert).unwrap();

    let query = LegacyRequest::Query {
        collection: "app.events".into(),
        flags: QueryFlags::empty(),
        number_to_skip: 0,
        number_to_return: 10,
        query: doc! {},
        fields: None,
    };
    let query_id = cluster.legacy_rpc_sendv_to_server(&stream, &query).unwrap();
    assert!(query_id > insert_id);

    let reply = cluster.try_recv(&stream, query_id).unwrap();
    assert_eq!(reply.documents.len(), 2);

    let state = state.borrow();
    let opcodes: Vec<OpCode> = state.sent_headers.iter().map(|header| header.op_code).collect();
    assert_eq!(opcodes, vec![OpCode::Msg, OpCode::Insert, OpCode::Query]);
}

#[test]
fn try_recv_rejects_replies_to_other_requests() {
    let (mut cluster, state) = new_cluster(default_config());
    {
        let mut state = state.borrow_mut();
        state.push(Reply::Msg(hello_reply()));
        state.push(Reply::Legacy(vec![doc! { "x": 1 }]));
    }

    let stream = cluster.stream_for_writes(None).unwrap();
    let query = LegacyRequest::Query {
        collection: "app.events".into(),
        flags: QueryFlags::empty(),
        number_to_skip: 0,
        number_to_return: 1,
        query: doc! {},
        fields: None,
    };
    let query_id = cluster.legacy_rpc_sendv_to_server(&stream, &query).unwrap();

    assert!(matches!(
        cluster.try_recv(&stream, query_id + 5),
        Err(Error::Protocol { .. })
    ));
    assert!(!cluster.is_connected(1));
}

mockall::mock! {
    Handler {}
    impl CommandEventHandler for Handler {
        fn command_started(&self, event: CommandStartedEvent);
        fn command_succeeded(&self, event: CommandSucceededEvent);
        fn command_failed(&self, event: CommandFailedEvent);
    }
}

#[test]
fn monitored_commands_emit_paired_events() {
    let (cluster, state) = new_cluster(default_config());
    {
        let mut state = state.borrow_mut();
        state.push(Reply::Msg(hello_reply()));
        state.push(Reply::Msg(doc! { "ok": 1.0 }));
        state.push(Reply::Msg(doc! {
            "ok": 0.0,
            "code": 59,
            "errmsg": "no such command",
        }));
    }

    let mut sequence = mockall::Sequence::new();
    let mut handler = MockHandler::new();
    handler
        .expect_command_started()
        .withf(|event| {
            event.operation_id == 1
                && event.command_name == "ping"
                && event.database == "app"
                && event.server_id == 1
        })
        .times(1)
        .in_sequence(&mut sequence)
        .return_const(());
    handler
        .expect_command_succeeded()
        .withf(|event| event.operation_id == 1 && event.command_name == "ping")
        .times(1)
        .in_sequence(&mut sequence)
        .return_const(());
    handler
        .expect_command_started()
        .withf(|event| event.operation_id == 2 && event.command_name == "explode")
        .times(1)
        .in_sequence(&mut sequence)
        .return_const(());
    handler
        .expect_command_failed()
        .withf(|event| event.operation_id == 2 && event.failure.contains("no such command"))
        .times(1)
        .in_sequence(&mut sequence)
        .return_const(());

    let mut cluster = cluster.with_event_handler(Box::new(handler));
    let stream = cluster.stream_for_writes(None).unwrap();

    cluster
        .run_command_monitored(&stream, CommandParts::new("app", doc! { "ping": 1 }), None)
        .unwrap();
    let failed = cluster.run_command_monitored(
        &stream,
        CommandParts::new("app", doc! { "explode": 1 }),
        None,
    );
    assert!(matches!(failed, Err(Error::Server { .. })));

    // Started and completion events carry the same request id.
    let state = state.borrow();
    assert_eq!(state.sent_headers.len(), 3);
}

#[test]
fn failed_sends_do_not_reuse_event_request_ids() {
    let (cluster, state) = new_cluster(default_config());
    {
        let mut state = state.borrow_mut();
        state.push(Reply::Msg(hello_reply())); // connect, request id 1
        state.push(Reply::Msg(hello_reply())); // reconnect, request id 3
        state.push(Reply::Msg(doc! { "ok": 1.0 }));
    }

    let mut sequence = mockall::Sequence::new();
    let mut handler = MockHandler::new();
    handler
        .expect_command_started()
        .withf(|event| event.operation_id == 1 && event.request_id == 2)
        .times(1)
        .in_sequence(&mut sequence)
        .return_const(());
    handler
        .expect_command_failed()
        .withf(|event| event.operation_id == 1 && event.request_id == 2)
        .times(1)
        .in_sequence(&mut sequence)
        .return_const(());
    handler
        .expect_command_started()
        .withf(|event| event.operation_id == 2 && event.request_id == 4)
        .times(1)
        .in_sequence(&mut sequence)
        .return_const(());
    handler
        .expect_command_succeeded()
        .withf(|event| event.operation_id == 2 && event.request_id == 4)
        .times(1)
        .in_sequence(&mut sequence)
        .return_const(());

    let mut cluster = cluster.with_event_handler(Box::new(handler));
    let stream = cluster.stream_for_writes(None).unwrap();
    cluster.disconnect_node(1);

    // Nothing reaches the wire, but the operation still consumes its id.
    let failed = cluster.run_command_monitored(
        &stream,
        CommandParts::new("app", doc! { "ping": 1 }),
        None,
    );
    assert!(matches!(failed, Err(Error::NotConnected(1))));

    let fresh = cluster.stream_for_writes(None).unwrap();
    cluster
        .run_command_monitored(&fresh, CommandParts::new("app", doc! { "ping": 1 }), None)
        .unwrap();

    // The wire carries exactly the ids the events reported.
    let state = state.borrow();
    let ids: Vec<i32> = state.sent_headers.iter().map(|header| header.request_id).collect();
    assert_eq!(ids, vec![1, 3, 4]);
}
