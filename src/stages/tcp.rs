//! TCP connect probe.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::stages::registry::{OptionMeta, StageDescriptor};
use crate::stages::{host_of, CheckContext, Stage, StageError, StageResult, StageSpec};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub static DESCRIPTOR: StageDescriptor = StageDescriptor {
    type_name: "tcp",
    display_name: "TCP Port",
    description: "Check TCP port connectivity",
    is_network_stage: true,
    options: &[OptionMeta {
        name: "port",
        label: "Port",
        kind: "number",
        required: true,
        default: None,
        description: "Port to connect to",
        placeholder: "443",
    }],
    build: TcpStage::from_spec,
};

pub struct TcpStage {
    port: u16,
}

impl TcpStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        spec.warn_unknown_options(&["type", "port"]);

        let port = match spec.options.get("port") {
            Some(raw) => spec.opt_u16("port").ok_or_else(|| {
                StageError::BadConfig(format!("tcp: `port` must be a port number, got {raw}"))
            })?,
            None => {
                return Err(StageError::BadConfig(
                    "tcp: missing required option `port`".to_string(),
                ))
            }
        };

        Ok(Box::new(TcpStage { port }))
    }
}

#[async_trait]
impl Stage for TcpStage {
    fn descriptor(&self) -> &'static StageDescriptor {
        &DESCRIPTOR
    }

    async fn check(&self, url: &str, _verbose: bool, _ctx: &mut CheckContext) -> StageResult {
        let Some((_, host)) = host_of(url) else {
            return StageResult::down("invalid_url").with_detail("error", "no hostname in URL");
        };
        let port = self.port;

        let start = Instant::now();
        let connect = tokio::net::TcpStream::connect((host.as_str(), port));
        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(_stream)) => {
                let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                StageResult::up(format!("port {port} open"))
                    .with_detail("hostname", host)
                    .with_detail("port", port)
                    .with_detail("connect_time_ms", elapsed)
                    .with_elapsed(elapsed)
            }
            Ok(Err(e)) => StageResult::down(format!("port {port} unreachable"))
                .with_detail("hostname", host)
                .with_detail("port", port)
                .with_detail("error", e.to_string())
                .with_elapsed(start.elapsed().as_secs_f64() * 1000.0),
            Err(_) => StageResult::down(format!("port {port} timeout"))
                .with_detail("hostname", host)
                .with_detail("port", port)
                .with_detail("error", "connect timeout")
                .with_elapsed(start.elapsed().as_secs_f64() * 1000.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_numeric_port() {
        let spec = StageSpec::new("tcp").with_option("port", 8080);
        assert!(TcpStage::from_spec(&spec).is_ok());
    }

    #[test]
    fn rejects_out_of_range_port() {
        let spec = StageSpec::new("tcp").with_option("port", 70000);
        assert!(matches!(
            TcpStage::from_spec(&spec),
            Err(StageError::BadConfig(_))
        ));
    }

    #[test]
    fn port_is_required() {
        assert!(matches!(
            TcpStage::from_spec(&StageSpec::new("tcp")),
            Err(StageError::BadConfig(_))
        ));
    }

    #[tokio::test]
    async fn connects_to_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let spec = StageSpec::new("tcp").with_option("port", port);
        let stage = TcpStage::from_spec(&spec).unwrap();

        let mut ctx = CheckContext::new();
        let result = stage.check("http://127.0.0.1", false, &mut ctx).await;
        assert_eq!(result.status, crate::stages::Status::Up);
        assert!(result.elapsed_ms >= 0.0);
    }
}
