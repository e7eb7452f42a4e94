//! Role and application configuration.
//!
//! Everything deserializes from JSON with every field defaulted, and every
//! struct has a builder for programmatic construction.

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    net::{sender::RetryPolicy, EndpointRef},
    WorkerID,
};

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidConfig(msg.into())
}

fn retry_policy(attempts: u32, timeout_ms: u64) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(attempts)
        .timeout(Duration::from_millis(timeout_ms))
        .build()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct GeneratorConf {
    #[builder(default)]
    pub generator_id: WorkerID,
    /// Per attempt
    #[builder(default = 100)]
    pub send_timeout_ms: u64,
    #[builder(default = 100)]
    pub send_attempts: u32,
    /// How long a request waits for its list to be created.
    #[builder(default = 1000)]
    pub request_timeout_ms: u64,
    #[builder(default = 1000)]
    pub storage_capacity: usize,
    #[builder(default = EndpointRef::new("generator0.create"))]
    pub create_input: EndpointRef,
    #[builder(default = EndpointRef::new("generator0.request"))]
    pub request_input: EndpointRef,
    /// Where a copy of every created list goes, if anywhere.
    #[builder(default)]
    pub originals_output: Option<EndpointRef>,
}

impl Default for GeneratorConf {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl GeneratorConf {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        retry_policy(self.send_attempts, self.send_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_capacity == 0 {
            Err(invalid("generator storage capacity must be at least 1"))?
        }
        if self.send_attempts == 0 {
            Err(invalid("send attempts must be at least 1"))?
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct ReverserConf {
    #[builder(default)]
    pub reverser_id: WorkerID,
    #[builder(default = 100)]
    pub send_timeout_ms: u64,
    #[builder(default = 100)]
    pub send_attempts: u32,
    /// How long a request may gather before it is flushed as is.
    #[builder(default = 1000)]
    pub request_timeout_ms: u64,
    #[builder(default = 10)]
    pub sweep_interval_ms: u64,
    /// How long `stop` waits for pending requests to finish.
    #[builder(default = 2000)]
    pub stop_grace_ms: u64,
    #[builder(default = EndpointRef::new("reverser0.request"))]
    pub request_input: EndpointRef,
    #[builder(default = EndpointRef::new("reverser0.lists"))]
    pub list_input: EndpointRef,
    /// Request endpoints of every generator, in order.
    #[builder(default)]
    pub generators: Vec<EndpointRef>,
}

impl Default for ReverserConf {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReverserConf {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        retry_policy(self.send_attempts, self.send_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.generators.is_empty() {
            Err(invalid("a reverser needs at least one generator"))?
        }
        if self.sweep_interval_ms == 0 {
            Err(invalid("sweep interval must be positive"))?
        }
        if self.send_attempts == 0 {
            Err(invalid("send attempts must be at least 1"))?
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct ValidatorConf {
    #[builder(default = 100)]
    pub send_timeout_ms: u64,
    #[builder(default = 100)]
    pub send_attempts: u32,
    /// Requests unanswered for twice this long are re-issued.
    #[builder(default = 1000)]
    pub request_timeout_ms: u64,
    #[builder(default = 10.)]
    pub request_rate_hz: f64,
    #[builder(default = 100)]
    pub max_outstanding_requests: usize,
    #[builder(default = 50)]
    pub min_list_size: u16,
    #[builder(default = 200)]
    pub max_list_size: u16,
    /// Halves of a round trip waiting for their counterpart
    #[builder(default = 1000)]
    pub cache_capacity: usize,
    #[builder(default = 1)]
    pub max_reissues: u32,
    #[builder(default = 2000)]
    pub stop_grace_ms: u64,
    #[builder(default = EndpointRef::new("validator.lists"))]
    pub list_input: EndpointRef,
    #[builder(default = EndpointRef::new("validator.originals"))]
    pub originals_input: EndpointRef,
    /// Create endpoints of every generator, in order.
    #[builder(default)]
    pub generators: Vec<EndpointRef>,
    /// Request endpoints of every reverser, in order.
    #[builder(default)]
    pub reversers: Vec<EndpointRef>,
    /// Lists expected in every aggregate. Defaults to one per generator.
    #[builder(default)]
    pub expected_results: Option<usize>,
}

impl Default for ValidatorConf {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ValidatorConf {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        retry_policy(self.send_attempts, self.send_timeout_ms)
    }

    pub fn expected_results(&self) -> usize {
        self.expected_results.unwrap_or(self.generators.len())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.request_rate_hz.is_finite() && self.request_rate_hz > 0.) {
            Err(invalid(format!(
                "request rate must be positive, got {}",
                self.request_rate_hz
            )))?
        }
        if self.max_outstanding_requests == 0 {
            Err(invalid("max outstanding requests must be at least 1"))?
        }
        if self.min_list_size > self.max_list_size {
            Err(invalid(format!(
                "min list size {} exceeds max list size {}",
                self.min_list_size, self.max_list_size
            )))?
        }
        if self.cache_capacity == 0 {
            Err(invalid("validator cache capacity must be at least 1"))?
        }
        if self.generators.is_empty() || self.reversers.is_empty() {
            Err(invalid(
                "a validator needs at least one generator and one reverser",
            ))?
        }
        if self.send_attempts == 0 {
            Err(invalid("send attempts must be at least 1"))?
        }
        Ok(())
    }
}

/// The whole demo application.
///
/// The role sections are templates: ids and endpoint names are filled in by
/// `topology`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct AppConf {
    #[builder(default = 3)]
    pub generators: usize,
    #[builder(default = 2)]
    pub reversers: usize,
    #[builder(default = 10_000)]
    pub duration_ms: u64,
    /// Frames an endpoint buffers before senders start timing out.
    #[builder(default = 100)]
    pub mailbox_capacity: usize,
    #[builder(default)]
    pub generator: GeneratorConf,
    #[builder(default)]
    pub reverser: ReverserConf,
    #[builder(default)]
    pub validator: ValidatorConf,
}

impl Default for AppConf {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Concrete per-instance configuration for every role.
#[derive(Clone, Debug, PartialEq)]
pub struct Topology {
    pub generators: Vec<GeneratorConf>,
    pub reversers: Vec<ReverserConf>,
    pub validator: ValidatorConf,
}

impl Topology {
    /// Every inbound endpoint, each exactly once.
    pub fn endpoints(&self) -> Vec<EndpointRef> {
        let mut endpoints = Vec::new();
        for g in &self.generators {
            endpoints.push(g.create_input.clone());
            endpoints.push(g.request_input.clone());
        }
        for r in &self.reversers {
            endpoints.push(r.request_input.clone());
            endpoints.push(r.list_input.clone());
        }
        endpoints.push(self.validator.list_input.clone());
        endpoints.push(self.validator.originals_input.clone());
        endpoints
    }
}

impl AppConf {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Names every endpoint and hands each role instance its own copy of
    /// the matching template.
    pub fn topology(&self) -> Result<Topology> {
        if self.generators == 0 || self.reversers == 0 {
            Err(invalid("need at least one generator and one reverser"))?
        }
        let validator_lists = EndpointRef::new("validator.lists");
        let validator_originals = EndpointRef::new("validator.originals");

        let generators = (0..self.generators)
            .map(|i| GeneratorConf {
                generator_id: i as WorkerID,
                create_input: EndpointRef::new(format!("generator{}.create", i)),
                request_input: EndpointRef::new(format!(
                    "generator{}.request",
                    i
                )),
                originals_output: Some(validator_originals.clone()),
                ..self.generator.clone()
            })
            .collect::<Vec<_>>();
        let generator_requests = generators
            .iter()
            .map(|g| g.request_input.clone())
            .collect::<Vec<_>>();

        let reversers = (0..self.reversers)
            .map(|i| ReverserConf {
                reverser_id: i as WorkerID,
                request_input: EndpointRef::new(format!("reverser{}.request", i)),
                list_input: EndpointRef::new(format!("reverser{}.lists", i)),
                generators: generator_requests.clone(),
                ..self.reverser.clone()
            })
            .collect::<Vec<_>>();

        let validator = ValidatorConf {
            list_input: validator_lists,
            originals_input: validator_originals,
            generators: generators
                .iter()
                .map(|g| g.create_input.clone())
                .collect(),
            reversers: reversers
                .iter()
                .map(|r| r.request_input.clone())
                .collect(),
            ..self.validator.clone()
        };

        let topology = Topology {
            generators,
            reversers,
            validator,
        };
        for g in &topology.generators {
            g.validate()?;
        }
        for r in &topology.reversers {
            r.validate()?;
        }
        topology.validator.validate()?;
        Ok(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let conf: AppConf = serde_json::from_str("{}").unwrap();
        assert_eq!(conf, AppConf::default());
        assert_eq!(conf.generator.request_timeout(), Duration::from_secs(1));
        assert_eq!(conf.reverser.sweep_interval_ms, 10);
        assert_eq!(conf.validator.max_outstanding_requests, 100);
        assert_eq!(conf.validator.retry_policy().max_attempts, 100);
    }

    #[test]
    fn partial_json_overrides_fields() {
        let conf: AppConf = serde_json::from_str(
            r#"{"generators": 5, "validator": {"request_rate_hz": 50.0}}"#,
        )
        .unwrap();
        assert_eq!(conf.generators, 5);
        assert_eq!(conf.validator.request_rate_hz, 50.);
        assert_eq!(conf.validator.min_list_size, 50);
    }

    #[test]
    fn topology_wires_every_role() {
        let conf = AppConf::builder().generators(3).reversers(2).build();
        let topology = conf.topology().unwrap();

        assert_eq!(topology.generators[2].generator_id, 2);
        assert_eq!(
            topology.generators[1].originals_output,
            Some(EndpointRef::new("validator.originals"))
        );
        assert_eq!(
            topology.reversers[1].generators,
            vec![
                EndpointRef::new("generator0.request"),
                EndpointRef::new("generator1.request"),
                EndpointRef::new("generator2.request"),
            ]
        );
        assert_eq!(topology.validator.reversers.len(), 2);
        assert_eq!(topology.validator.expected_results(), 3);

        let mut endpoints = topology.endpoints();
        let n = endpoints.len();
        endpoints.sort();
        endpoints.dedup();
        assert_eq!(endpoints.len(), n);
        assert_eq!(n, 3 * 2 + 2 * 2 + 2);
    }

    #[test]
    fn rejects_inverted_list_sizes() {
        let conf = AppConf::builder()
            .validator(
                ValidatorConf::builder()
                    .min_list_size(10)
                    .max_list_size(5)
                    .build(),
            )
            .build();
        assert!(matches!(conf.topology(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_an_empty_topology() {
        let conf = AppConf::builder().reversers(0).build();
        assert!(matches!(conf.topology(), Err(Error::InvalidConfig(_))));
    }
}
