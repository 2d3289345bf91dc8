use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawProject {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub supervisor: Option<RawSupervisor>,
    pub services: BTreeMap<String, RawService>,
}

fn default_version() -> u32 {
    1
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawSupervisor {
    pub poll_interval_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
    pub port_attempts: Option<u16>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawService {
    #[serde(default)]
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub deps: Option<Vec<String>>,
    pub port: Option<RawPort>,
    pub probe: Option<RawProbe>,
    pub timeout_secs: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub owned: Option<bool>,
    pub required: Option<bool>,
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub(crate) enum RawPort {
    Fixed(u16),
    Allocate { from: u16 },
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RawProbe {
    Tcp(String),
    Http(String),
    Process,
}
