use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use vardelay_sim::shaping::CentralShaping;
use vardelay_sim::DelayWalkConfig;

use crate::error::{Result, RunError};
use crate::flow::{Direction, FlowSpec, LinkShape, Role};

pub const METADATA_NAME: &str = "metadata.json";

/// `metadata.json` as written by the layout tooling.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataInput {
    #[serde(rename = "_rate")]
    pub rate_mbit: f64,
    #[serde(rename = "_runtime")]
    pub runtime_secs: u64,
    #[serde(rename = "_max-delay")]
    pub max_delay_us: u64,
    #[serde(rename = "_seed")]
    pub seed: SeedInput,
    #[serde(rename = "_buffer")]
    pub buffer_kib: u32,
    #[serde(rename = "_first-queue")]
    pub first_queue: u32,
    #[serde(rename = "_second-queue")]
    pub second_queue: u32,
    #[serde(rename = "_base")]
    pub base_us: u64,
    #[serde(rename = "_delta")]
    pub delta_us: u64,
    #[serde(rename = "_step")]
    pub step_us: u64,
    #[serde(rename = "_jitter")]
    pub jitter_us: u64,
    #[serde(rename = "sorted-layout")]
    pub layout: Vec<LayoutEntryInput>,
    #[serde(rename = "_all-flows")]
    pub all_flows: usize,
}

/// A layout entry: `flows` identical flows.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LayoutEntryInput {
    pub scheme: String,
    pub flows: usize,
    pub start: u64,
    pub direction: String,
    pub left_rate: f64,
    pub right_rate: f64,
    pub left_delay: u64,
    pub right_delay: u64,
    pub left_queues: u32,
    pub right_queues: u32,
    #[serde(default)]
    pub runs_first: Option<String>,
}

/// Seeds are written as integers, but older layouts store floats.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SeedInput {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl SeedInput {
    pub fn to_u64(self) -> u64 {
        match self {
            SeedInput::Unsigned(v) => v,
            SeedInput::Signed(v) => v as u64,
            SeedInput::Float(v) if v.fract() == 0.0 && v.abs() < 2f64.powi(63) => v as i64 as u64,
            SeedInput::Float(v) => v.to_bits(),
        }
    }
}

/// Run-wide parameters, fixed for the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParameters {
    pub rate_mbit: f64,
    pub runtime: Duration,
    pub max_delay_us: u64,
    pub seed: u64,
    pub buffer_kib: u32,
    pub first_queue: u32,
    pub second_queue: u32,
    pub base_us: u64,
    pub delta_us: u64,
    pub step_us: u64,
    pub jitter_us: u64,
}

impl RunParameters {
    pub fn delay_walk(&self) -> DelayWalkConfig {
        DelayWalkConfig {
            base_us: self.base_us,
            delta_us: self.delta_us,
            step_us: self.step_us,
            max_delay_us: self.max_delay_us,
            runtime_us: self.runtime.as_micros() as u64,
            seed: self.seed,
        }
    }

    pub fn central_shaping(&self, delay_us: u64) -> CentralShaping {
        CentralShaping {
            rate_mbit: self.rate_mbit,
            delay_us,
            jitter_us: self.jitter_us,
            first_queue: self.first_queue,
            second_queue: self.second_queue,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub params: RunParameters,
    pub flows: Vec<FlowSpec>,
}

impl RunConfig {
    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.flows.iter().map(|f| f.scheme.as_str())
    }
}

/// Read `<dir>/metadata.json`.
pub fn load(dir: &Path) -> Result<MetadataInput> {
    let path = dir.join(METADATA_NAME);
    let text = std::fs::read_to_string(&path).map_err(|source| RunError::MetadataRead {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| RunError::MetadataFormat { path, source })
}

impl MetadataInput {
    /// Expand the layout into one [`FlowSpec`] per flow and validate it.
    ///
    /// `runs_first` answers for schemes whose entry does not say which role
    /// starts first; it is asked once per scheme.
    pub fn resolve(
        self,
        mut runs_first: impl FnMut(&str) -> Result<Role>,
    ) -> Result<RunConfig> {
        // Zero leaves the central link without a rate limit.
        if !self.rate_mbit.is_finite() || self.rate_mbit < 0.0 {
            return Err(RunError::Metadata(format!(
                "central link rate must be zero or positive, got {}",
                self.rate_mbit
            )));
        }

        let mut asked: HashMap<String, Role> = HashMap::new();
        let mut flows = Vec::with_capacity(self.all_flows);

        for (idx, entry) in self.layout.into_iter().enumerate() {
            if entry.start >= self.runtime_secs {
                return Err(RunError::Metadata(format!(
                    "layout entry {}: start {}s must be below the runtime of {}s",
                    idx + 1,
                    entry.start,
                    self.runtime_secs
                )));
            }

            let direction: Direction = entry
                .direction
                .parse()
                .map_err(|e| RunError::Metadata(format!("layout entry {}: {e}", idx + 1)))?;

            let role = match entry.runs_first.as_deref() {
                Some(role) => role
                    .parse()
                    .map_err(|e| RunError::Metadata(format!("layout entry {}: {e}", idx + 1)))?,
                None => match asked.get(&entry.scheme) {
                    Some(role) => *role,
                    None => {
                        let role = runs_first(&entry.scheme)?;
                        asked.insert(entry.scheme.clone(), role);
                        role
                    }
                },
            };

            let left = LinkShape {
                rate_mbit: entry.left_rate,
                delay_us: entry.left_delay,
                queue_packets: entry.left_queues,
            };
            let right = LinkShape {
                rate_mbit: entry.right_rate,
                delay_us: entry.right_delay,
                queue_packets: entry.right_queues,
            };

            for _ in 0..entry.flows {
                flows.push(FlowSpec {
                    id: flows.len(),
                    scheme: entry.scheme.clone(),
                    direction,
                    left: left.clone(),
                    right: right.clone(),
                    start_secs: entry.start,
                    runs_first: role,
                });
            }
        }

        if flows.len() != self.all_flows {
            return Err(RunError::Metadata(format!(
                "field \"_all-flows\"={} must be {} (sum of all \"flows\" in \"sorted-layout\")",
                self.all_flows,
                flows.len()
            )));
        }
        if flows.is_empty() {
            return Err(RunError::Metadata("layout has no flows".into()));
        }

        Ok(RunConfig {
            params: RunParameters {
                rate_mbit: self.rate_mbit,
                runtime: Duration::from_secs(self.runtime_secs),
                max_delay_us: self.max_delay_us,
                seed: self.seed.to_u64(),
                buffer_kib: self.buffer_kib,
                first_queue: self.first_queue,
                second_queue: self.second_queue,
                base_us: self.base_us,
                delta_us: self.delta_us,
                step_us: self.step_us,
                jitter_us: self.jitter_us,
            },
            flows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn metadata() -> serde_json::Value {
        json!({
            "_rate": 100,
            "_runtime": 30,
            "_max-delay": 20000,
            "_seed": 42,
            "_buffer": 4096,
            "_first-queue": 1000,
            "_second-queue": 800,
            "_base": 1000,
            "_delta": 500000,
            "_step": 100,
            "_jitter": 0,
            "_all-flows": 3,
            "sorted-layout": [
                {
                    "scheme": "cubic", "flows": 2, "start": 0, "direction": "->",
                    "left-rate": 50.5, "right-rate": 50, "left-delay": 300, "right-delay": 400,
                    "left-queues": 500, "right-queues": 600, "runs-first": "receiver"
                },
                {
                    "scheme": "bbr", "flows": 1, "start": 4, "direction": "<-",
                    "left-rate": 10, "right-rate": 20, "left-delay": 0, "right-delay": 0,
                    "left-queues": 100, "right-queues": 100
                }
            ]
        })
    }

    fn input(value: serde_json::Value) -> MetadataInput {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn layout_expands_into_flows() {
        let mut asked = Vec::new();
        let cfg = input(metadata())
            .resolve(|scheme| {
                asked.push(scheme.to_string());
                Ok(Role::Sender)
            })
            .unwrap();

        assert_eq!(asked, vec!["bbr"]);
        assert_eq!(cfg.flows.len(), 3);
        assert_eq!(
            cfg.flows.iter().map(|f| f.id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let first = &cfg.flows[0];
        assert_eq!(first.direction, Direction::Rightward);
        assert_eq!(first.runs_first, Role::Receiver);
        assert_eq!(first.left.rate_mbit, 50.5);
        assert_eq!(first.right.queue_packets, 600);

        let last = &cfg.flows[2];
        assert_eq!(last.scheme, "bbr");
        assert_eq!(last.start_secs, 4);
        assert_eq!(last.runs_first, Role::Sender);

        assert_eq!(cfg.params.runtime, Duration::from_secs(30));
        assert_eq!(cfg.params.delay_walk().runtime_us, 30_000_000);
        assert_eq!(cfg.params.central_shaping(1000).second_queue, 800);
    }

    #[test]
    fn flow_total_must_match() {
        let mut value = metadata();
        value["_all-flows"] = json!(4);
        let err = input(value).resolve(|_| Ok(Role::Sender)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("_all-flows"));
    }

    #[test]
    fn bad_direction_is_rejected() {
        let mut value = metadata();
        value["sorted-layout"][0]["direction"] = json!("<>");
        let err = input(value).resolve(|_| Ok(Role::Sender)).unwrap_err();
        assert!(err.to_string().contains("layout entry 1"));
    }

    #[test]
    fn zero_rate_leaves_the_central_link_unlimited() {
        let mut value = metadata();
        value["_rate"] = json!(0);
        let cfg = input(value).resolve(|_| Ok(Role::Sender)).unwrap();

        assert_eq!(cfg.params.rate_mbit, 0.0);
        assert_eq!(cfg.params.central_shaping(1000).rate_mbit, 0.0);
    }

    #[test]
    fn negative_rate_is_rejected() {
        let mut value = metadata();
        value["_rate"] = json!(-1);
        let err = input(value).resolve(|_| Ok(Role::Sender)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("central link rate"));
    }

    #[test]
    fn start_must_fall_within_the_runtime() {
        let mut value = metadata();
        value["sorted-layout"][1]["start"] = json!(30);
        let err = input(value.clone())
            .resolve(|_| Ok(Role::Sender))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("layout entry 2"));

        value["sorted-layout"][1]["start"] = json!(29);
        assert!(input(value).resolve(|_| Ok(Role::Sender)).is_ok());
    }

    #[test]
    fn seeds_accept_integers_and_floats() {
        let mut value = metadata();
        value["_seed"] = json!(7.0);
        assert_eq!(input(value.clone()).seed.to_u64(), 7);

        value["_seed"] = json!(0.25);
        assert_eq!(input(value.clone()).seed.to_u64(), 0.25f64.to_bits());

        value["_seed"] = json!(-3);
        assert_eq!(input(value).seed.to_u64(), (-3i64) as u64);
    }

    #[test]
    fn metadata_is_loaded_from_the_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(METADATA_NAME),
            serde_json::to_string_pretty(&metadata()).unwrap(),
        )
        .unwrap();
        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.all_flows, 3);
        assert_eq!(loaded.layout.len(), 2);
    }

    #[test]
    fn missing_or_broken_metadata_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(dir.path()).unwrap_err();
        assert!(matches!(err, RunError::MetadataRead { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        std::fs::write(dir.path().join(METADATA_NAME), "{ not json").unwrap();
        assert!(matches!(
            load(dir.path()),
            Err(RunError::MetadataFormat { .. })
        ));
    }
}
