//! The per-query pipeline: query plugins, upstream selection, encrypted
//! exchange, response plugins, reply.
//!
//! Errors never escape `process_query`. Every terminal path updates
//! server health where appropriate and runs the logging plugins exactly
//! once; a query that cannot be answered is dropped without a reply and
//! the stub resolver retries.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rand::Rng as _;
use seal_dns_lib::{
    encrypt_query, has_tc_flag, rcode, truncated_response, SharedKey, MAX_DNS_PACKET_SIZE, MAX_DNS_UDP_PACKET_SIZE,
    MIN_DNS_PACKET_SIZE, QUERY_OVERHEAD, RCODE_SERVFAIL, RESPONSE_OVERHEAD,
};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::plugins::{ClientProto, PluginAction, PluginReturnCode, PluginsState};
use crate::proxy::Proxy;
use crate::servers::{ServerInfo, ServerProto};
use crate::socket::OobUdpSocket;
use crate::transport;

/// Where and how the reply goes back to the client.
pub enum ReplySink<'a> {
    Udp {
        socket: Arc<OobUdpSocket>,
        peer: SocketAddr,
        /// Destination address of the query, recovered from ancillary
        /// data; replies are sent with it as the source
        dst: Option<IpAddr>,
    },
    Tcp {
        stream: &'a mut TcpStream,
        peer: SocketAddr,
    },
}

impl ReplySink<'_> {
    fn client_proto(&self) -> ClientProto {
        match self {
            ReplySink::Udp { .. } => ClientProto::Udp,
            ReplySink::Tcp { .. } => ClientProto::Tcp,
        }
    }

    fn client_addr(&self) -> SocketAddr {
        match self {
            ReplySink::Udp { peer, .. } => *peer,
            ReplySink::Tcp { peer, .. } => *peer,
        }
    }
}

pub async fn process_query(
    proxy: &Proxy,
    server: Option<Arc<ServerInfo>>,
    mut sink: ReplySink<'_>,
    mut query: Vec<u8>,
    start: Instant,
) {
    if query.len() < MIN_DNS_PACKET_SIZE {
        return;
    }
    let client_proto = sink.client_proto();
    let server_name = server.as_ref().map(|s| s.name.clone()).unwrap_or_else(|| "-".to_string());
    let mut state = PluginsState::new(client_proto, sink.client_addr(), server_name, start);

    if let Err(e) = proxy.plugins.apply_query_plugins(&mut state, &mut query) {
        tracing::debug!("query plugins rejected the query: {:#}", e);
        state.return_code = PluginReturnCode::ParseError;
        proxy.plugins.apply_logging_plugins(&state);
        return;
    }
    if query.len() < MIN_DNS_PACKET_SIZE || query.len() > MAX_DNS_PACKET_SIZE {
        state.return_code = PluginReturnCode::ParseError;
        proxy.plugins.apply_logging_plugins(&state);
        return;
    }

    let mut response = Vec::new();
    match state.action {
        PluginAction::Drop => {
            if state.return_code == PluginReturnCode::Pass {
                state.return_code = PluginReturnCode::Drop;
            }
            proxy.plugins.apply_logging_plugins(&state);
            return;
        }
        PluginAction::Synth => match state.synth_response.take() {
            Some(synth) => response = synth,
            None => {
                state.return_code = PluginReturnCode::ParseError;
                proxy.plugins.apply_logging_plugins(&state);
                return;
            }
        },
        PluginAction::Forward => {
            if state.return_code == PluginReturnCode::Pass {
                state.return_code = PluginReturnCode::Forward;
            }
        }
    }

    if response.is_empty() {
        let Some(server) = server.as_ref() else {
            tracing::debug!("dropping query: no live server");
            state.return_code = PluginReturnCode::ServerError;
            proxy.plugins.apply_logging_plugins(&state);
            return;
        };
        let exchange_started = Instant::now();

        let outcome = match server.proto {
            ServerProto::DnsCrypt => {
                let Some(certificate) = server.certificate() else {
                    state.return_code = PluginReturnCode::ServerError;
                    server.notice_failure();
                    proxy.plugins.apply_logging_plugins(&state);
                    return;
                };
                let (secret_key, public_key) = proxy.session_keys();
                let shared_key = SharedKey::new(certificate.cipher, &secret_key, &certificate.resolver_pk);
                let use_udp = client_proto == ClientProto::Udp && !proxy.config.force_tcp;
                let min_question_size = if use_udp {
                    proxy.question_size_estimator.min_question_size()
                } else {
                    // TCP padding doesn't gate response sizes, a random
                    // amount just masks the question length
                    QUERY_OVERHEAD + query.len() + rand::thread_rng().gen_range(0..256)
                };
                let sealed = encrypt_query(
                    &shared_key,
                    &public_key,
                    &certificate.client_magic,
                    &query,
                    min_question_size,
                );
                match sealed {
                    Err(e) => {
                        tracing::debug!(server = %server.name, "could not seal the query: {}", e);
                        state.return_code = PluginReturnCode::ParseError;
                        proxy.plugins.apply_logging_plugins(&state);
                        return;
                    }
                    Ok((encrypted_query, client_nonce)) => {
                        if use_udp {
                            transport::exchange_dnscrypt_udp(server, &shared_key, &encrypted_query, &client_nonce)
                                .await
                        } else {
                            transport::exchange_dnscrypt_tcp(
                                server,
                                proxy.dialer.as_ref(),
                                &shared_key,
                                &encrypted_query,
                                &client_nonce,
                            )
                            .await
                        }
                    }
                }
            }
            ServerProto::Doh => transport::exchange_doh(proxy.http_client.as_ref(), server, &query).await,
        };

        response = match outcome {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(server = %server.name, "upstream exchange failed: {}", e);
                state.return_code = PluginReturnCode::ServerError;
                server.notice_failure();
                proxy.plugins.apply_logging_plugins(&state);
                return;
            }
        };
        if response.len() < MIN_DNS_PACKET_SIZE || response.len() > MAX_DNS_PACKET_SIZE {
            state.return_code = PluginReturnCode::ParseError;
            server.notice_failure();
            proxy.plugins.apply_logging_plugins(&state);
            return;
        }

        // Out-parameter for response plugins that want to override TTLs;
        // no bundled plugin reads it back yet
        let mut ttl = None;
        if let Err(e) = proxy.plugins.apply_response_plugins(&mut state, &mut response, &mut ttl) {
            tracing::debug!(server = %server.name, "response plugins rejected the response: {:#}", e);
            state.return_code = PluginReturnCode::ParseError;
            server.notice_failure();
            proxy.plugins.apply_logging_plugins(&state);
            return;
        }

        if rcode(&response) == RCODE_SERVFAIL {
            tracing::info!(server = %server.name, "upstream returned a temporary failure");
            server.notice_failure();
        } else {
            server.notice_success(exchange_started.elapsed());
        }
    }

    if response.len() < MIN_DNS_PACKET_SIZE || response.len() > MAX_DNS_PACKET_SIZE {
        state.return_code = PluginReturnCode::ParseError;
        if let Some(server) = server.as_ref() {
            server.notice_failure();
        }
        proxy.plugins.apply_logging_plugins(&state);
        return;
    }

    match &mut sink {
        ReplySink::Udp { socket, peer, dst } => {
            if response.len() > MAX_DNS_UDP_PACKET_SIZE {
                response = match truncated_response(&query) {
                    Ok(truncated) => truncated,
                    Err(e) => {
                        tracing::debug!("could not build a truncated response: {}", e);
                        state.return_code = PluginReturnCode::ParseError;
                        proxy.plugins.apply_logging_plugins(&state);
                        return;
                    }
                };
            }
            if let Err(e) = socket.send_to_from(&response, *peer, *dst).await {
                tracing::debug!(client = %peer, "failed to send a UDP reply: {}", e);
            }
            if has_tc_flag(&response) {
                proxy.question_size_estimator.blind_adjust();
            } else {
                proxy.question_size_estimator.adjust(RESPONSE_OVERHEAD + response.len());
            }
        }
        ReplySink::Tcp { stream, peer } => {
            if let Err(e) = transport::write_prefixed(stream, &response).await {
                tracing::debug!(client = %peer, "failed to send a TCP reply: {}", e);
            }
        }
    }
    proxy.plugins.apply_logging_plugins(&state);
}
