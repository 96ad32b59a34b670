//! Shared request/reply plumbing: request-id sequencing, the
//! send-one-receive-one command exchange, `ok` classification and the
//! connect-time `hello` handshake shapes.
use bson::{doc, Bson, Document};
use std::time::Instant;

use mongo_protocol::cluster_time::ClusterTime;
use mongo_protocol::message::{
    OpMsg, DEFAULT_MAX_BSON_OBJ_SIZE, DEFAULT_MAX_MSG_SIZE, DEFAULT_MAX_WRITE_BATCH_SIZE,
};
use mongo_protocol::{Error, Result};

use crate::config::{ClientConfig, Credential};
use crate::transport::Transport;

/// Advances the cluster-scoped request-id counter. Every message sent on any
/// of the cluster's connections draws from the same sequence.
pub(crate) fn next_request_id(counter: &mut i32) -> i32 {
    *counter = counter.wrapping_add(1);
    *counter
}

/// Sends one command body on `db` and receives its reply. The reply must
/// answer exactly the sent request id; anything else means the connection is
/// desynchronized.
pub(crate) fn run_command_on(
    transport: &mut dyn Transport,
    request_id: i32,
    db: &str,
    mut body: Document,
    deadline: Option<Instant>,
) -> Result<Document> {
    body.insert("$db", db);

    let mut segments = Vec::with_capacity(1);
    OpMsg::new(body).encode_into(request_id, &mut segments)?;
    transport.send(&segments, deadline)?;

    let frame = transport.receive(deadline)?;
    let (header, reply) = OpMsg::decode(&frame).map_err(|error| Error::Protocol {
        address: transport.peer_address().to_string(),
        message: error.to_string(),
    })?;

    if header.response_to != request_id {
        return Err(Error::Protocol {
            address: transport.peer_address().to_string(),
            message: format!(
                "Reply to request {} arrived while awaiting {}",
                header.response_to, request_id
            ),
        });
    }

    command_ok(reply.body)
}

/// Splits a reply into success and server-reported failure.
pub(crate) fn command_ok(reply: Document) -> Result<Document> {
    let ok = match reply.get("ok") {
        Some(Bson::Double(value)) => *value == 1.0,
        Some(Bson::Int32(value)) => *value == 1,
        Some(Bson::Int64(value)) => *value == 1,
        Some(Bson::Boolean(value)) => *value,
        _ => false,
    };

    if ok {
        return Ok(reply);
    }

    Err(Error::Server {
        code: reply.get_i32("code").unwrap_or(0),
        code_name: reply.get_str("codeName").unwrap_or_default().to_string(),
        message: reply
            .get_str("errmsg")
            .unwrap_or("Command failed")
            .to_string(),
    })
}

/// Builds the connect-time `hello` body with client metadata and, when a
/// credential is present, the mechanism-negotiation request.
pub(crate) fn build_hello(config: &ClientConfig, credential: Option<&Credential>) -> Document {
    let mut client = doc! {
        "driver": {
            "name": "mdrs",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "os": { "type": std::env::consts::OS },
    };
    if let Some(app_name) = config.app_name() {
        client.insert("application", doc! { "name": app_name });
    }

    let mut hello = doc! { "hello": 1, "client": client };
    if let Some(credential) = credential {
        if !credential.username().is_empty() {
            hello.insert(
                "saslSupportedMechs",
                format!("{}.{}", credential.source(), credential.username()),
            );
        }
    }
    hello
}

/// Negotiated connection parameters from the `hello` reply; missing fields
/// fall back to the protocol defaults.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HelloReply {
    pub max_bson_obj_size: i32,
    pub max_msg_size: i32,
    pub max_write_batch_size: i32,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub sasl_supported_mechs: Option<Vec<String>>,
    pub cluster_time: Option<ClusterTime>,
}

impl HelloReply {
    pub(crate) fn parse(reply: &Document) -> HelloReply {
        HelloReply {
            max_bson_obj_size: reply
                .get_i32("maxBsonObjectSize")
                .unwrap_or(DEFAULT_MAX_BSON_OBJ_SIZE),
            max_msg_size: reply
                .get_i32("maxMessageSizeBytes")
                .unwrap_or(DEFAULT_MAX_MSG_SIZE),
            max_write_batch_size: reply
                .get_i32("maxWriteBatchSize")
                .unwrap_or(DEFAULT_MAX_WRITE_BATCH_SIZE),
            min_wire_version: reply.get_i32("minWireVersion").unwrap_or(0),
            max_wire_version: reply.get_i32("maxWireVersion").unwrap_or(0),
            sasl_supported_mechs: reply.get_array("saslSupportedMechs").ok().map(|values| {
                values
                    .iter()
                    .filter_map(|value| value.as_str().map(str::to_string))
                    .collect()
            }),
            cluster_time: reply
                .get_document("$clusterTime")
                .ok()
                .and_then(|document| ClusterTime::from_document(document).ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_strictly_increase() {
        let mut counter = 0;
        let first = next_request_id(&mut counter);
        let second = next_request_id(&mut counter);
        assert!(second > first);
    }

    #[test]
    fn ok_classification() {
        assert!(command_ok(doc! { "ok": 1.0 }).is_ok());
        assert!(command_ok(doc! { "ok": 1 }).is_ok());

        let error = command_ok(doc! {
            "ok": 0.0,
            "code": 59,
            "codeName": "CommandNotFound",
            "errmsg": "no such command",
        })
        .unwrap_err();
        match error {
            Error::Server {
                code,
                code_name,
                message,
            } => {
                assert_eq!(code, 59);
                assert_eq!(code_name, "CommandNotFound");
                assert_eq!(message, "no such command");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn hello_carries_negotiation_request() {
        use crate::config::ClientConfigBuilder;

        let config = ClientConfigBuilder::new().with_app_name("svc".into()).build();
        let credential = Credential::new("app".into(), Some("secret".into()));

        let hello = build_hello(&config, Some(&credential));
        assert_eq!(hello.get_i32("hello").unwrap(), 1);
        assert_eq!(hello.get_str("saslSupportedMechs").unwrap(), "admin.app");
        let client = hello.get_document("client").unwrap();
        assert_eq!(
            client.get_document("application").unwrap().get_str("name").unwrap(),
            "svc"
        );

        let anonymous = build_hello(&config, None);
        assert!(!anonymous.contains_key("saslSupportedMechs"));
    }

    #[test]
    fn hello_reply_defaults() {
        let parsed = HelloReply::parse(&doc! { "ok": 1.0 });
        assert_eq!(parsed.max_bson_obj_size, DEFAULT_MAX_BSON_OBJ_SIZE);
        assert_eq!(parsed.max_msg_size, DEFAULT_MAX_MSG_SIZE);
        assert_eq!(parsed.max_write_batch_size, DEFAULT_MAX_WRITE_BATCH_SIZE);
        assert!(parsed.sasl_supported_mechs.is_none());

        let parsed = HelloReply::parse(&doc! {
            "ok": 1.0,
            "maxBsonObjectSize": 1024,
            "maxWireVersion": 21,
            "saslSupportedMechs": ["SCRAM-SHA-1", "SCRAM-SHA-256"],
        });
        assert_eq!(parsed.max_bson_obj_size, 1024);
        assert_eq!(parsed.max_wire_version, 21);
        assert_eq!(
            parsed.sasl_supported_mechs.as_deref(),
            Some(&["SCRAM-SHA-1".to_string(), "SCRAM-SHA-256".to_string()][..])
        );
    }
}
