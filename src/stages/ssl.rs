//! TLS certificate probe: connects, inspects the peer certificate, and warns
//! ahead of expiry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::stages::registry::{OptionMeta, StageDescriptor};
use crate::stages::{host_of, CheckContext, Stage, StageError, StageResult, StageSpec};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WARN_DAYS: i64 = 30;

pub static DESCRIPTOR: StageDescriptor = StageDescriptor {
    type_name: "ssl",
    display_name: "SSL Certificate",
    description: "Check SSL certificate validity and expiration",
    is_network_stage: true,
    options: &[OptionMeta {
        name: "warn_days",
        label: "Warning Days",
        kind: "number",
        required: false,
        default: Some("30"),
        description: "Days before expiry to show warning",
        placeholder: "30",
    }],
    build: SslStage::from_spec,
};

pub struct SslStage {
    warn_days: i64,
}

impl SslStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        spec.warn_unknown_options(&["type", "warn_days"]);

        let warn_days = match spec.opt_f64("warn_days") {
            Some(v) if v >= 0.0 => v as i64,
            Some(_) => {
                return Err(StageError::BadConfig(
                    "ssl: `warn_days` must be a non-negative number".to_string(),
                ))
            }
            None => DEFAULT_WARN_DAYS,
        };

        Ok(Box::new(SslStage { warn_days }))
    }
}

#[async_trait]
impl Stage for SslStage {
    fn descriptor(&self) -> &'static StageDescriptor {
        &DESCRIPTOR
    }

    async fn check(&self, url: &str, _verbose: bool, _ctx: &mut CheckContext) -> StageResult {
        let start = Instant::now();

        let Some((parsed, host)) = host_of(url) else {
            return StageResult::down("invalid_url").with_detail("error", "no hostname in URL");
        };
        let port = parsed.port().unwrap_or(443);

        let server_name = match ServerName::try_from(host.clone()) {
            Ok(name) => name,
            Err(e) => {
                return StageResult::down("invalid_hostname")
                    .with_detail("error", e.to_string())
                    .with_elapsed(elapsed_ms(start));
            }
        };

        let stream = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio::net::TcpStream::connect((host.as_str(), port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return StageResult::down("connect_failed")
                    .with_detail("hostname", host)
                    .with_detail("port", port)
                    .with_detail("error", e.to_string())
                    .with_elapsed(elapsed_ms(start));
            }
            Err(_) => {
                return StageResult::down("connect_timeout")
                    .with_detail("hostname", host)
                    .with_detail("port", port)
                    .with_elapsed(elapsed_ms(start));
            }
        };

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let tls_stream = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            connector.connect(server_name, stream),
        )
        .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                // Expired and otherwise invalid certificates fail the
                // handshake; both are hard failures.
                return StageResult::down("certificate_invalid")
                    .with_detail("hostname", host)
                    .with_detail("port", port)
                    .with_detail("error", e.to_string())
                    .with_elapsed(elapsed_ms(start));
            }
            Err(_) => {
                return StageResult::down("handshake_timeout")
                    .with_detail("hostname", host)
                    .with_detail("port", port)
                    .with_elapsed(elapsed_ms(start));
            }
        };

        let (_, session) = tls_stream.get_ref();
        let Some(peer_certs) = session.peer_certificates() else {
            return StageResult::down("no_certificate")
                .with_detail("hostname", host)
                .with_detail("port", port)
                .with_elapsed(elapsed_ms(start));
        };
        let Some(leaf) = peer_certs.first() else {
            return StageResult::down("no_certificate")
                .with_detail("hostname", host)
                .with_detail("port", port)
                .with_elapsed(elapsed_ms(start));
        };

        let cert = match X509Certificate::from_der(leaf.as_ref()) {
            Ok((_, cert)) => cert,
            Err(e) => {
                return StageResult::down("certificate_unparseable")
                    .with_detail("hostname", host)
                    .with_detail("error", e.to_string())
                    .with_elapsed(elapsed_ms(start));
            }
        };

        let subject = cert.subject().to_string();
        let issuer = cert.issuer().to_string();
        let not_after = timestamp_to_utc(cert.validity().not_after.timestamp());
        let days_remaining = (not_after - Utc::now()).num_days();
        let elapsed = elapsed_ms(start);

        let details = json!({
            "hostname": host,
            "port": port,
            "subject": subject,
            "issuer": issuer,
            "not_after": not_after.to_rfc3339(),
            "days_remaining": days_remaining,
        });
        let details = details.as_object().cloned().unwrap_or_default();

        let mut result = if days_remaining < 0 {
            StageResult::down(format!("expired {} days ago", -days_remaining))
        } else if days_remaining <= self.warn_days {
            StageResult::degraded(format!("expires in {days_remaining} days"))
        } else {
            StageResult::up(format!("valid, expires in {days_remaining} days"))
        };
        result.details = details;
        result.with_elapsed(elapsed)
    }
}

fn timestamp_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
