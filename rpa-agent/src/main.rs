use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use rpa_core::transport::{Envelope, EnvelopeCodec, MessageType, PayloadFormat};
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{CpuExt, System, SystemExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Reference robot client: speaks the same framed HELLO/WELCOME session
/// protocol the gateway's listener terminates, §4.3. Executes nothing real —
/// every assignment is accepted and "completed" after a short simulated
/// run, standing in for a workflow engine.
#[derive(Parser, Debug)]
#[command(name = "rpa-agent")]
struct AgentArgs {
    /// host:port of the gateway's robot transport listener.
    #[arg(long, default_value = "127.0.0.1:7443")]
    addr: String,

    /// PEM file containing the CA that signed the gateway's TLS certificate.
    #[arg(long)]
    ca_cert: String,

    /// This robot's client certificate, §6: its Subject CN must equal the
    /// robot_id the credential authenticates as.
    #[arg(long)]
    client_cert: String,

    /// Private key matching `client_cert`.
    #[arg(long)]
    client_key: String,

    /// Robot-scoped API key returned when the robot was registered.
    #[arg(long, env = "RPA_ROBOT_CREDENTIAL")]
    credential: String,

    /// TLS server name to verify the gateway's certificate against.
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Payload encoding to request at HELLO.
    #[arg(long, default_value = "messagepack")]
    format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    rpa_core::init_tracing();
    let args = AgentArgs::parse();
    info!(addr = %args.addr, "agent starting");

    let connector = build_connector(&args.ca_cert, &args.client_cert, &args.client_key)?;
    let server_name = ServerName::try_from(args.server_name.clone())
        .map_err(|_| anyhow!("invalid server name {}", args.server_name))?;
    let requested_format = match args.format.as_str() {
        "json" => PayloadFormat::Json,
        _ => PayloadFormat::MessagePack,
    };

    let tcp = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("connecting to {}", args.addr))?;
    let tls = connector.connect(server_name, tcp).await.context("tls handshake")?;
    let mut framed = Framed::new(tls, EnvelopeCodec::new());

    let hello_id = Uuid::new_v4().as_u128();
    let format_name = if requested_format == PayloadFormat::Json { "json" } else { "messagepack" };
    framed
        .send(Envelope::new(
            hello_id,
            MessageType::Hello,
            serde_json::json!({ "credential": args.credential, "format": format_name }),
        ))
        .await
        .context("send hello")?;

    let welcome = tokio::time::timeout(Duration::from_secs(10), framed.next())
        .await
        .map_err(|_| anyhow!("timed out waiting for welcome"))?
        .ok_or_else(|| anyhow!("connection closed before welcome"))?
        .context("decode welcome frame")?;
    if welcome.kind != MessageType::Welcome {
        return Err(anyhow!("expected WELCOME, got {:?}", welcome.kind));
    }
    // Format chosen in the HELLO payload takes effect for every frame after
    // WELCOME, mirroring the gateway listener's negotiation.
    framed.codec_mut().set_format(requested_format);
    let (mut sink, mut stream) = framed.split();
    let robot_id = welcome
        .payload
        .get("robot_id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let ping_interval_secs = welcome
        .payload
        .get("ping_interval_secs")
        .and_then(Value::as_u64)
        .unwrap_or(15);
    info!(%robot_id, "session active");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(32);
    let mut sys = System::new_all();
    let mut heartbeat_ticker = tokio::time::interval(Duration::from_secs(ping_interval_secs.max(5)));
    let mut msg_id: u128 = hello_id + 1;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("agent shutting down");
                break;
            }
            _ = heartbeat_ticker.tick() => {
                sys.refresh_cpu();
                sys.refresh_memory();
                let metrics = serde_json::json!({
                    "cpu": sys.global_cpu_info().cpu_usage(),
                    "memory_used_bytes": sys.used_memory() * 1024,
                });
                msg_id += 1;
                if sink.send(Envelope::new(msg_id, MessageType::Heartbeat, metrics)).await.is_err() {
                    warn!("heartbeat send failed, connection likely closed");
                    break;
                }
            }
            out = outbound_rx.recv() => {
                match out {
                    Some(envelope) => {
                        if sink.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(envelope)) => handle_inbound(envelope, outbound_tx.clone()),
                    Some(Err(e)) => {
                        error!(error = %e, "frame decode error");
                        break;
                    }
                    None => {
                        info!("gateway closed the session");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

fn handle_inbound(envelope: Envelope, outbound_tx: mpsc::Sender<Envelope>) {
    match envelope.kind {
        MessageType::Assign => {
            let job_id = envelope.payload.get("job_id").cloned().unwrap_or(Value::Null);
            info!(job_id = %job_id, "received assignment");
            tokio::spawn(run_job(envelope.msg_id, job_id, outbound_tx));
        }
        MessageType::Cancel => {
            let job_id = envelope.payload.get("job_id").cloned().unwrap_or(Value::Null);
            info!(job_id = %job_id, "received cancel request");
            let reply = Envelope::reply_to(
                envelope.msg_id,
                envelope.msg_id + 1,
                MessageType::Cancelled,
                serde_json::json!({ "job_id": job_id }),
            );
            let _ = outbound_tx.try_send(reply);
        }
        MessageType::Ping => {
            let reply = Envelope::reply_to(envelope.msg_id, envelope.msg_id + 1, MessageType::Pong, Value::Null);
            let _ = outbound_tx.try_send(reply);
        }
        MessageType::Error => {
            warn!(payload = %envelope.payload, "gateway reported a protocol error");
        }
        other => {
            warn!(kind = ?other, "unexpected frame from gateway");
        }
    }
}

/// Simulates executing a workflow: accept, report progress, report a
/// successful result. A real robot would replace this with its automation
/// engine.
async fn run_job(base_msg_id: u128, job_id: Value, outbound_tx: mpsc::Sender<Envelope>) {
    let accept = Envelope::new(
        base_msg_id + 1,
        MessageType::Accept,
        serde_json::json!({ "job_id": job_id }),
    );
    if outbound_tx.send(accept).await.is_err() {
        return;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let progress = Envelope::new(
        base_msg_id + 2,
        MessageType::Progress,
        serde_json::json!({ "job_id": job_id, "progress": 50, "current_node": "execute" }),
    );
    if outbound_tx.send(progress).await.is_err() {
        return;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let result = Envelope::new(
        base_msg_id + 3,
        MessageType::Result,
        serde_json::json!({ "job_id": job_id, "status": "completed", "result": { "ok": true } }),
    );
    let _ = outbound_tx.send(result).await;
}

fn build_connector(ca_cert_path: &str, client_cert_path: &str, client_key_path: &str) -> Result<TlsConnector> {
    let file = File::open(ca_cert_path).with_context(|| format!("opening {ca_cert_path}"))?;
    let mut reader = BufReader::new(file);
    let ca_certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates from {ca_cert_path}"))?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert)?;
    }

    let client_cert_file =
        File::open(client_cert_path).with_context(|| format!("opening {client_cert_path}"))?;
    let client_chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(client_cert_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates from {client_cert_path}"))?;
    let client_key_file =
        File::open(client_key_path).with_context(|| format!("opening {client_key_path}"))?;
    let mut client_keys = pkcs8_private_keys(&mut BufReader::new(client_key_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing private key from {client_key_path}"))?;
    let client_key = PrivateKeyDer::Pkcs8(
        client_keys.pop().ok_or_else(|| anyhow!("no PKCS#8 private key found in {client_key_path}"))?,
    );

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(client_chain, client_key)
        .context("building client TLS config")?;
    Ok(TlsConnector::from(Arc::new(config)))
}
