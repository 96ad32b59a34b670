//! Authentication engine. Runs once per connection, between the `hello`
//! handshake and the node's insertion into the table; a failure here means
//! the candidate connection is discarded, never inserted.
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use std::time::Instant;
use tracing::debug;

use mongo_protocol::scram::{ScramCache, ScramStart, ScramVariant};
use mongo_protocol::{Error, Result};

use crate::cluster::wire::{next_request_id, run_command_on};
use crate::config::{AuthMechanism, Credential};
use crate::tls::{self, TlsOptions};
use crate::transport::Transport;

/// Picks the mechanism for a credential. An explicitly configured mechanism
/// is honored as-is; otherwise the server's advertised list decides,
/// preferring SCRAM-SHA-256, and servers that advertise nothing get
/// SCRAM-SHA-1.
pub(crate) fn negotiate_mechanism(
    credential: &Credential,
    supported: Option<&[String]>,
) -> AuthMechanism {
    if let Some(mechanism) = credential.mechanism() {
        return mechanism;
    }

    let prefers_sha256 = supported
        .into_iter()
        .flatten()
        .filter_map(|name| ScramVariant::from_mechanism_name(name))
        .any(|variant| variant == ScramVariant::Sha256);

    if prefers_sha256 {
        AuthMechanism::ScramSha256
    } else {
        AuthMechanism::ScramSha1
    }
}

/// Authenticates a candidate connection.
pub(crate) fn authenticate(
    transport: &mut dyn Transport,
    request_id: &mut i32,
    credential: &Credential,
    supported: Option<&[String]>,
    tls_options: Option<&TlsOptions>,
    scram_cache: &mut ScramCache,
    deadline: Option<Instant>,
) -> Result<()> {
    let mechanism = negotiate_mechanism(credential, supported);
    debug!(
        address = transport.peer_address(),
        ?mechanism,
        "Authenticating connection"
    );

    match mechanism {
        AuthMechanism::ScramSha1 => scram_conversation(
            transport,
            request_id,
            credential,
            ScramVariant::Sha1,
            scram_cache,
            deadline,
        ),
        AuthMechanism::ScramSha256 => scram_conversation(
            transport,
            request_id,
            credential,
            ScramVariant::Sha256,
            scram_cache,
            deadline,
        ),
        AuthMechanism::MongoDbX509 => {
            x509_authenticate(transport, request_id, credential, tls_options, deadline)
        }
    }
}

/// Drives one SCRAM conversation: `saslStart`, `saslContinue` with the
/// proof, and a final empty `saslContinue` when the server did not honor
/// `skipEmptyExchange`.
fn scram_conversation(
    transport: &mut dyn Transport,
    request_id: &mut i32,
    credential: &Credential,
    variant: ScramVariant,
    scram_cache: &mut ScramCache,
    deadline: Option<Instant>,
) -> Result<()> {
    let password = credential
        .password()
        .ok_or_else(|| auth_error("SCRAM authentication requires a password"))?;

    let start = ScramStart::new(variant, credential.username(), password)?;
    let (client_first, first_sent) = start.client_first();

    let reply = run_command_on(
        transport,
        next_request_id(request_id),
        credential.source(),
        doc! {
            "saslStart": 1,
            "mechanism": variant.mechanism_name(),
            "payload": binary(client_first),
            "autoAuthorize": 1,
            "options": { "skipEmptyExchange": true },
        },
        deadline,
    )
    .map_err(as_auth_failure)?;

    let conversation_id = conversation_id(&reply)?;
    let (client_final, final_sent) =
        first_sent.handle_server_first(sasl_payload(&reply)?, scram_cache)?;

    let reply = run_command_on(
        transport,
        next_request_id(request_id),
        credential.source(),
        doc! {
            "saslContinue": 1,
            "conversationId": conversation_id.clone(),
            "payload": binary(client_final),
        },
        deadline,
    )
    .map_err(as_auth_failure)?;

    final_sent.handle_server_final(sasl_payload(&reply)?)?;

    if !is_done(&reply) {
        // Older servers want one empty round before reporting completion.
        let reply = run_command_on(
            transport,
            next_request_id(request_id),
            credential.source(),
            doc! {
                "saslContinue": 1,
                "conversationId": conversation_id,
                "payload": binary(Vec::new()),
            },
            deadline,
        )
        .map_err(as_auth_failure)?;

        if !is_done(&reply) {
            return Err(auth_error("Server did not complete the SASL conversation"));
        }
    }

    Ok(())
}

/// X.509 authentication: a single `authenticate` command against
/// `$external`, identifying the client by its certificate subject.
fn x509_authenticate(
    transport: &mut dyn Transport,
    request_id: &mut i32,
    credential: &Credential,
    tls_options: Option<&TlsOptions>,
    deadline: Option<Instant>,
) -> Result<()> {
    let subject = if credential.username().is_empty() {
        let pem_file = tls_options
            .and_then(|options| options.pem_file.as_deref())
            .ok_or_else(|| {
                auth_error("X.509 authentication requires a client certificate file")
            })?;
        tls::extract_subject(pem_file)?
    } else {
        credential.username().to_string()
    };

    run_command_on(
        transport,
        next_request_id(request_id),
        "$external",
        doc! {
            "authenticate": 1,
            "mechanism": "MONGODB-X509",
            "user": subject,
        },
        deadline,
    )
    .map_err(as_auth_failure)?;

    Ok(())
}

fn binary(bytes: Vec<u8>) -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    }
}

fn sasl_payload(reply: &Document) -> Result<&[u8]> {
    reply
        .get_binary_generic("payload")
        .map(Vec::as_slice)
        .map_err(|_| auth_error("SASL reply is missing its payload"))
}

/// Conversation ids correlate the steps of one exchange; the value is
/// echoed back verbatim, whatever its type.
fn conversation_id(reply: &Document) -> Result<Bson> {
    reply
        .get("conversationId")
        .cloned()
        .ok_or_else(|| auth_error("SASL reply is missing its conversation id"))
}

fn is_done(reply: &Document) -> bool {
    reply.get_bool("done").unwrap_or(false)
}

fn auth_error(reason: &str) -> Error {
    Error::Authentication {
        reason: reason.to_string(),
    }
}

/// Server-side rejections during the conversation surface as authentication
/// failures; transport failures keep their own classification.
fn as_auth_failure(error: Error) -> Error {
    match error {
        Error::Server { message, .. } => auth_error(&message),
        other => other,
    }
}
