use std::{collections::BTreeMap, path::PathBuf, time::Duration};

/// Token replaced with the resolved port in commands, environment values and
/// probe targets.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Environment variable exported to owned processes that have a port.
pub const PORT_ENV: &str = "PORT";

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    /// Always use this port.
    Fixed(u16),
    /// Use the first free port at or above `from`.
    Allocate { from: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSpec {
    /// `host:port` that must accept a TCP connection.
    Tcp { address: String },
    /// URL that must answer a GET with a 2xx status.
    Http { url: String },
    /// The owned process must still be running.
    ProcessAlive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub cmd: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub port: Option<PortSpec>,
    pub probe: ProbeSpec,
    pub timeout: Duration,
    pub probe_timeout: Duration,
    /// `false` for services started by someone else; they are only observed.
    pub owned: bool,
}

impl ServiceSpec {
    /// A service whose process is started and stopped by the supervisor.
    #[must_use]
    pub fn owned<I, S>(name: impl Into<String>, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            cmd: cmd.into_iter().map(Into::into).collect(),
            cwd: None,
            env: BTreeMap::new(),
            port: None,
            probe: ProbeSpec::ProcessAlive,
            timeout: DEFAULT_STARTUP_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            owned: true,
        }
    }

    /// A service managed outside the supervisor that is only probed.
    #[must_use]
    pub fn external(name: impl Into<String>, probe: ProbeSpec) -> Self {
        Self {
            name: name.into(),
            cmd: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            port: None,
            probe,
            timeout: DEFAULT_STARTUP_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            owned: false,
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: ProbeSpec) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: PortSpec) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Replace every [`PORT_PLACEHOLDER`] in `template` with `port`.
#[must_use]
pub fn expand_port(template: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => template.replace(PORT_PLACEHOLDER, &port.to_string()),
        None => template.to_owned(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Delay between two readiness probe attempts.
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL when stopping an owned process.
    pub grace_period: Duration,
    /// How many consecutive ports the allocator tries.
    pub port_attempts: u16,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            grace_period: Duration::from_secs(3),
            port_attempts: 100,
        }
    }
}
