//! DNS resolution probe.

use std::net::IpAddr;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use crate::stages::registry::{OptionMeta, StageDescriptor};
use crate::stages::{host_of, CheckContext, Stage, StageError, StageResult, StageSpec};

pub static DESCRIPTOR: StageDescriptor = StageDescriptor {
    type_name: "dns",
    display_name: "DNS",
    description: "Check DNS resolution",
    is_network_stage: true,
    options: &[OptionMeta {
        name: "expected_ip",
        label: "Expected IP",
        kind: "string",
        required: false,
        default: None,
        description: "Degrade unless DNS resolves to this address",
        placeholder: "1.2.3.4",
    }],
    build: DnsStage::from_spec,
};

pub struct DnsStage {
    expected_ip: Option<IpAddr>,
}

impl DnsStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        spec.warn_unknown_options(&["type", "expected_ip"]);

        let expected_ip = match spec.opt_str("expected_ip") {
            Some(raw) => Some(raw.parse().map_err(|_| {
                StageError::BadConfig(format!("dns: `expected_ip` is not an IP address: {raw}"))
            })?),
            None => None,
        };

        Ok(Box::new(DnsStage { expected_ip }))
    }
}

#[async_trait]
impl Stage for DnsStage {
    fn descriptor(&self) -> &'static StageDescriptor {
        &DESCRIPTOR
    }

    async fn check(&self, url: &str, _verbose: bool, _ctx: &mut CheckContext) -> StageResult {
        let Some((_, host)) = host_of(url) else {
            return StageResult::down("invalid_url").with_detail("error", "no hostname in URL");
        };

        let start = Instant::now();
        let host_for_lookup = host.clone();
        let lookup_result = tokio::net::lookup_host((host_for_lookup.as_str(), 0u16)).await;
        let addrs = match lookup_result {
            Ok(addrs) => addrs,
            Err(e) => {
                return StageResult::down("resolution_failed")
                    .with_detail("hostname", host)
                    .with_detail("error", e.to_string())
                    .with_elapsed(start.elapsed().as_secs_f64() * 1000.0);
            }
        };
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;

        let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        ips.sort();
        ips.dedup();
        let ipv4: Vec<String> = ips
            .iter()
            .filter(|ip| ip.is_ipv4())
            .map(IpAddr::to_string)
            .collect();
        let ipv6: Vec<String> = ips
            .iter()
            .filter(|ip| ip.is_ipv6())
            .map(IpAddr::to_string)
            .collect();

        if ips.is_empty() {
            return StageResult::down("no_records")
                .with_detail("hostname", host)
                .with_elapsed(elapsed);
        }

        let details = |result: StageResult| {
            result
                .with_detail("hostname", host.clone())
                .with_detail("ipv4", json!(ipv4))
                .with_detail("ipv6", json!(ipv6))
                .with_detail("resolve_time_ms", elapsed)
                .with_elapsed(elapsed)
        };

        if let Some(expected) = self.expected_ip {
            if ips.contains(&expected) {
                details(StageResult::up(format!("resolved to {expected}")))
            } else {
                details(
                    StageResult::degraded(format!("expected {expected}"))
                        .with_detail("expected_ip", expected.to_string()),
                )
            }
        } else {
            let primary = ipv4.first().or(ipv6.first()).cloned().unwrap_or_default();
            details(StageResult::up(format!("resolved to {primary}")))
        }
    }
}
