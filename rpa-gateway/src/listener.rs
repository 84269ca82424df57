//! Robot wire-protocol TLS listener, §4.3. Terminates TLS, frames the
//! stream with `EnvelopeCodec`, runs the HELLO/WELCOME handshake, and
//! bridges every subsequent frame into the Queue/Registry/SessionRegistry —
//! the mirror image of what `Dispatcher` writes onto a session.
use anyhow::{anyhow, Context};
use futures::{SinkExt, StreamExt};
use rpa_core::platform::models::{JobErrorCode, PrincipalType, RobotId, TenantId};
use rpa_core::platform::registry::PlatformServices;
use rpa_core::transport::{Envelope, EnvelopeCodec, MessageType, PayloadFormat, SessionState};
use rpa_core::TransportConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

pub async fn serve(platform: Arc<PlatformServices>, config: TransportConfig) -> anyhow::Result<()> {
    let acceptor = build_acceptor(&config)?;
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "robot transport listening");
    let hello_timeout = Duration::from_secs(config.hello_timeout_secs);
    let ping_interval = Duration::from_secs(config.ping_interval_secs);
    let missed_pong_threshold = config.missed_pong_threshold;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "robot transport accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let platform = platform.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_one(
                stream,
                peer,
                acceptor,
                platform,
                hello_timeout,
                ping_interval,
                missed_pong_threshold,
            )
            .await
            {
                warn!(%peer, error = %e, "robot session ended");
            }
        });
    }
}

async fn accept_one(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    platform: Arc<PlatformServices>,
    hello_timeout: Duration,
    ping_interval: Duration,
    missed_pong_threshold: u32,
) -> anyhow::Result<()> {
    let tls_stream: tokio_rustls::server::TlsStream<TcpStream> =
        acceptor.accept(stream).await.context("tls handshake")?;
    let peer_cn = peer_common_name(&tls_stream)?;
    let mut framed = Framed::new(tls_stream, EnvelopeCodec::new());

    // HELLO/WELCOME is always MessagePack; the format negotiated here only
    // governs frames after WELCOME, so this must happen before `.split()`
    // since `Framed::split` gives up access to `codec_mut`.
    let hello = tokio::time::timeout(hello_timeout, framed.next())
        .await
        .map_err(|_| anyhow!("hello timeout"))?
        .ok_or_else(|| anyhow!("connection closed before hello"))?
        .context("decode hello frame")?;
    if hello.kind != MessageType::Hello {
        return Err(anyhow!("expected HELLO, got {:?}", hello.kind));
    }
    let credential = hello
        .payload
        .get("credential")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("hello frame missing credential"))?;
    let ctx = platform
        .auth()
        .authenticate_api_key(credential)
        .map_err(|e| anyhow!("hello authentication failed: {e}"))?;
    if ctx.principal_type != PrincipalType::Robot {
        return Err(anyhow!("hello credential is not a robot key"));
    }
    let robot_id: RobotId = ctx.principal_id;
    let tenant_id: TenantId = ctx.tenant_id;
    if peer_cn != robot_id.to_string() {
        return Err(anyhow!(
            "client cert CN {peer_cn:?} does not match robot_id {robot_id}"
        ));
    }

    let format = match hello.payload.get("format").and_then(Value::as_str) {
        Some("json") => PayloadFormat::Json,
        _ => PayloadFormat::MessagePack,
    };
    framed.codec_mut().set_format(format);
    let (mut sink, mut stream) = framed.split();

    let mut rx = platform.sessions().open(robot_id, tenant_id);
    let welcome = Envelope::reply_to(
        hello.msg_id,
        0,
        MessageType::Welcome,
        serde_json::json!({ "robot_id": robot_id, "ping_interval_secs": ping_interval.as_secs() }),
    );
    sink.send(welcome).await.context("send welcome")?;
    platform.sessions().set_state(robot_id, SessionState::Active);
    info!(%robot_id, %tenant_id, %peer, "robot session active");

    let writer_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if sink.send(envelope).await.is_err() {
                break;
            }
        }
    });

    let ping_platform = platform.clone();
    let ping_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        loop {
            ticker.tick().await;
            if ping_platform
                .sessions()
                .send(robot_id, Envelope::new(0, MessageType::Ping, Value::Null))
                .is_err()
            {
                break;
            }
            let stale = ping_platform
                .sessions()
                .stale_sessions(ping_interval.as_secs(), missed_pong_threshold);
            if stale.contains(&robot_id) {
                break;
            }
        }
    });

    let result = read_loop(&mut stream, &platform, robot_id).await;

    writer_task.abort();
    ping_task.abort();
    platform.sessions().close(robot_id);
    info!(%robot_id, "robot session closed");
    result
}

async fn read_loop(
    stream: &mut (impl futures::Stream<Item = std::io::Result<Envelope>> + Unpin),
    platform: &Arc<PlatformServices>,
    robot_id: RobotId,
) -> anyhow::Result<()> {
    while let Some(frame) = stream.next().await {
        let envelope = frame.context("decode frame")?;
        if let Err(e) = handle_frame(platform, robot_id, envelope) {
            warn!(%robot_id, error = %e, "frame handling failed");
        }
    }
    Ok(())
}

fn handle_frame(
    platform: &Arc<PlatformServices>,
    robot_id: RobotId,
    envelope: Envelope,
) -> anyhow::Result<()> {
    let queue = platform.queue();
    let robots = platform.robots();
    match envelope.kind {
        MessageType::Heartbeat => {
            let metrics = envelope
                .payload
                .get("metrics")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            robots.heartbeat(robot_id, metrics)?;
        }
        MessageType::Accept => {
            let job_id = job_id_of(&envelope)?;
            queue.mark_running(job_id, robot_id)?;
        }
        MessageType::Reject => {
            let job_id = job_id_of(&envelope)?;
            let reason = envelope
                .payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("robot rejected assignment")
                .to_string();
            robots.release_slot(robot_id, job_id)?;
            queue.fail(job_id, robot_id, reason, None)?;
        }
        MessageType::Progress => {
            let job_id = job_id_of(&envelope)?;
            let progress = envelope
                .payload
                .get("progress")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                .min(100) as u8;
            let current_node = envelope
                .payload
                .get("current_node")
                .and_then(Value::as_str)
                .map(str::to_string);
            queue.update_progress(job_id, robot_id, envelope.msg_id, progress, current_node)?;
        }
        MessageType::Result => {
            let job_id = job_id_of(&envelope)?;
            let status = envelope
                .payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("failed");
            if status == "completed" {
                let result = envelope.payload.get("result").cloned();
                queue.complete(job_id, robot_id, envelope.msg_id, result)?;
                robots.release_slot(robot_id, job_id)?;
            } else {
                let error = envelope
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("job failed")
                    .to_string();
                let code = envelope
                    .payload
                    .get("error_code")
                    .and_then(Value::as_str)
                    .and_then(parse_error_code);
                queue.fail(job_id, robot_id, error, code)?;
                robots.release_slot(robot_id, job_id)?;
            }
        }
        MessageType::Cancelled => {
            let job_id = job_id_of(&envelope)?;
            queue.confirm_cancelled(job_id, robot_id)?;
            robots.release_slot(robot_id, job_id)?;
        }
        MessageType::Pong => {
            platform.sessions().record_pong(robot_id);
        }
        MessageType::Ping => {
            let _ = platform
                .sessions()
                .send(robot_id, Envelope::reply_to(envelope.msg_id, 0, MessageType::Pong, Value::Null));
        }
        MessageType::Error => {
            warn!(%robot_id, payload = %envelope.payload, "robot reported a protocol error");
        }
        other => {
            warn!(%robot_id, kind = ?other, "unexpected frame from robot");
        }
    }
    Ok(())
}

fn job_id_of(envelope: &Envelope) -> anyhow::Result<uuid::Uuid> {
    envelope
        .payload
        .get("job_id")
        .and_then(Value::as_str)
        .and_then(|s| uuid::Uuid::parse_str(s).ok())
        .ok_or_else(|| anyhow!("frame missing job_id"))
}

fn parse_error_code(raw: &str) -> Option<JobErrorCode> {
    match raw {
        "WINDOW_NOT_FOUND" => Some(JobErrorCode::WindowNotFound),
        "ELEMENT_NOT_FOUND" => Some(JobErrorCode::ElementNotFound),
        "CONNECTION_REFUSED" => Some(JobErrorCode::ConnectionRefused),
        "RATE_LIMIT_EXCEEDED" => Some(JobErrorCode::RateLimitExceeded),
        "CIRCUIT_OPEN" => Some(JobErrorCode::CircuitOpen),
        "TIMEOUT" => Some(JobErrorCode::Timeout),
        "AUTH_FAILED" => Some(JobErrorCode::AuthFailed),
        "INVALID_PAYLOAD" => Some(JobErrorCode::InvalidPayload),
        _ => None,
    }
}

/// Extracts the leaf client certificate's Subject CN, §6: "client cert CN
/// matches `robot_id`". Requires `with_client_cert_verifier`, so a missing
/// peer certificate here means the verifier is misconfigured, not a bypass.
fn peer_common_name(tls_stream: &tokio_rustls::server::TlsStream<TcpStream>) -> anyhow::Result<String> {
    let certs = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .ok_or_else(|| anyhow!("no client certificate presented"))?;
    let leaf = certs.first().ok_or_else(|| anyhow!("empty client certificate chain"))?;
    let parsed = x509_certificate::X509Certificate::from_der(leaf.as_ref())
        .context("parsing client certificate")?;
    parsed
        .subject_common_name()
        .ok_or_else(|| anyhow!("client certificate has no Subject CN"))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {path}"))?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates from {path}"))
}

fn load_private_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {path}"))?;
    let mut reader = BufReader::new(file);
    let mut keys = pkcs8_private_keys(&mut reader).collect::<Result<Vec<_>, _>>()?;
    let key = keys
        .pop()
        .ok_or_else(|| anyhow!("no PKCS#8 private key found in {path}"))?;
    Ok(PrivateKeyDer::Pkcs8(key))
}

fn build_acceptor(config: &TransportConfig) -> anyhow::Result<TlsAcceptor> {
    let cert_path = config
        .tls_cert_path
        .as_deref()
        .ok_or_else(|| anyhow!("transport.tls_cert_path not configured"))?;
    let key_path = config
        .tls_key_path
        .as_deref()
        .ok_or_else(|| anyhow!("transport.tls_key_path not configured"))?;
    let cert_chain = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let ca_path = config
        .tls_client_ca_path
        .as_deref()
        .ok_or_else(|| anyhow!("transport.tls_client_ca_path not configured, mTLS is mandatory for the robot listener"))?;
    let mut roots = RootCertStore::empty();
    for ca_cert in load_certs(ca_path)? {
        roots.add(ca_cert)?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
