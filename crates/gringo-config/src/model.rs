use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use gringo_types::{
    PortSpec, ProbeSpec, ServiceSpec, SupervisorSettings, DEFAULT_PROBE_TIMEOUT,
    DEFAULT_STARTUP_TIMEOUT, PORT_PLACEHOLDER,
};

use crate::{
    raw::{RawPort, RawProbe, RawProject, RawService, RawSupervisor},
    ConfigError,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub version: u32,
    /// File the project was loaded from.
    pub path: PathBuf,
    pub settings: SupervisorSettings,
    pub services: BTreeMap<String, Service>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub spec: ServiceSpec,
    pub deps: Vec<String>,
    /// A failed required service makes `gringo` exit non-zero.
    pub required: bool,
}

impl RawProject {
    pub(crate) fn into_project(self, path: &Path) -> Result<Project, ConfigError> {
        let base = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut errors = Vec::new();

        let settings = convert_settings(self.supervisor.unwrap_or_default(), &mut errors);

        let mut services = BTreeMap::new();
        for (name, raw_service) in self.services {
            if let Some(service) = convert_service(&name, raw_service, base, &mut errors) {
                services.insert(name, service);
            }
        }

        for (name, service) in &services {
            for dep in &service.deps {
                if dep == name {
                    errors.push(format!("service `{name}`: depends on itself"));
                } else if !services.contains_key(dep) {
                    errors.push(format!("service `{name}`: unknown dependency `{dep}`"));
                }
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors.join("; ")));
        }

        Ok(Project {
            version: self.version,
            path: path.to_path_buf(),
            settings,
            services,
        })
    }
}

fn convert_settings(raw: RawSupervisor, errors: &mut Vec<String>) -> SupervisorSettings {
    let defaults = SupervisorSettings::default();

    if raw.poll_interval_ms == Some(0) {
        errors.push("supervisor: poll_interval_ms must be positive".to_owned());
    }
    if raw.port_attempts == Some(0) {
        errors.push("supervisor: port_attempts must be positive".to_owned());
    }

    SupervisorSettings {
        poll_interval: raw
            .poll_interval_ms
            .map_or(defaults.poll_interval, Duration::from_millis),
        grace_period: raw
            .grace_period_ms
            .map_or(defaults.grace_period, Duration::from_millis),
        port_attempts: raw.port_attempts.unwrap_or(defaults.port_attempts),
    }
}

fn convert_service(
    name: &str,
    raw: RawService,
    base: Option<&Path>,
    errors: &mut Vec<String>,
) -> Option<Service> {
    let before = errors.len();
    let owned = raw.owned.unwrap_or(true);

    if name.trim().is_empty() {
        errors.push("service name is empty".to_owned());
    }
    if owned && raw.cmd.is_empty() {
        errors.push(format!("service `{name}`: cmd is empty"));
    }
    if raw.cmd.iter().any(|c| c.trim().is_empty()) {
        errors.push(format!("service `{name}`: cmd contains empty element"));
    }
    if raw.timeout_secs == Some(0) {
        errors.push(format!("service `{name}`: timeout_secs must be positive"));
    }
    if raw.probe_timeout_ms == Some(0) {
        errors.push(format!("service `{name}`: probe_timeout_ms must be positive"));
    }

    let probe = match raw.probe {
        None | Some(RawProbe::Process) => {
            if !owned {
                errors.push(format!(
                    "service `{name}`: external services need a tcp or http probe"
                ));
            }
            ProbeSpec::ProcessAlive
        }
        Some(RawProbe::Tcp(address)) => ProbeSpec::Tcp { address },
        Some(RawProbe::Http(url)) => ProbeSpec::Http { url },
    };

    let target = match &probe {
        ProbeSpec::Tcp { address } => Some(address),
        ProbeSpec::Http { url } => Some(url),
        ProbeSpec::ProcessAlive => None,
    };
    if let Some(target) = target {
        if target.trim().is_empty() {
            errors.push(format!("service `{name}`: probe target is empty"));
        }
        if target.contains(PORT_PLACEHOLDER) && raw.port.is_none() {
            errors.push(format!(
                "service `{name}`: probe uses {PORT_PLACEHOLDER} but no port is configured"
            ));
        }
    }

    if errors.len() > before {
        return None;
    }

    let cwd = raw.cwd.map(PathBuf::from).map(|cwd| match base {
        Some(base) if cwd.is_relative() => base.join(cwd),
        _ => cwd,
    });

    let spec = ServiceSpec {
        name: name.to_owned(),
        cmd: raw.cmd,
        cwd: cwd.or_else(|| base.map(Path::to_path_buf)),
        env: raw.env.unwrap_or_default(),
        port: raw.port.map(|port| match port {
            RawPort::Fixed(port) => PortSpec::Fixed(port),
            RawPort::Allocate { from } => PortSpec::Allocate { from },
        }),
        probe,
        timeout: raw
            .timeout_secs
            .map_or(DEFAULT_STARTUP_TIMEOUT, Duration::from_secs),
        probe_timeout: raw
            .probe_timeout_ms
            .map_or(DEFAULT_PROBE_TIMEOUT, Duration::from_millis),
        owned,
    };

    Some(Service {
        spec,
        deps: raw.deps.unwrap_or_default(),
        required: raw.required.unwrap_or(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_service(cmd: &[&str]) -> RawService {
        RawService {
            cmd: cmd.iter().map(|c| (*c).to_owned()).collect(),
            cwd: None,
            env: None,
            deps: None,
            port: None,
            probe: None,
            timeout_secs: None,
            probe_timeout_ms: None,
            owned: None,
            required: None,
        }
    }

    fn raw_project(services: Vec<(&str, RawService)>) -> RawProject {
        RawProject {
            version: 1,
            supervisor: None,
            services: services
                .into_iter()
                .map(|(name, service)| (name.to_owned(), service))
                .collect(),
        }
    }

    #[test]
    fn test_raw_to_project_success() {
        let raw = raw_project(vec![
            (
                "dashboard",
                RawService {
                    cwd: Some("ui".to_owned()),
                    env: Some(BTreeMap::from([("KEY".to_owned(), "Value".to_owned())])),
                    deps: Some(vec!["ollama".to_owned()]),
                    port: Some(RawPort::Allocate { from: 8501 }),
                    probe: Some(RawProbe::Http(
                        "http://127.0.0.1:{port}/_stcore/health".to_owned(),
                    )),
                    timeout_secs: Some(10),
                    required: Some(false),
                    ..raw_service(&["streamlit", "run", "app.py"])
                },
            ),
            (
                "ollama",
                RawService {
                    probe: Some(RawProbe::Tcp("127.0.0.1:11434".to_owned())),
                    owned: Some(false),
                    ..raw_service(&[])
                },
            ),
        ]);

        let project = raw.into_project(Path::new("/srv/gringo/gringo.toml")).unwrap();

        let dashboard = &project.services["dashboard"];
        assert_eq!(
            dashboard.spec.cwd.as_deref(),
            Some(Path::new("/srv/gringo/ui"))
        );
        assert_eq!(dashboard.spec.env["KEY"], "Value");
        assert_eq!(dashboard.spec.port, Some(PortSpec::Allocate { from: 8501 }));
        assert_eq!(dashboard.spec.timeout, Duration::from_secs(10));
        assert_eq!(dashboard.deps, vec!["ollama"]);
        assert!(!dashboard.required);

        let ollama = &project.services["ollama"];
        assert!(!ollama.spec.owned);
        assert!(ollama.required);
        assert_eq!(
            ollama.spec.probe,
            ProbeSpec::Tcp {
                address: "127.0.0.1:11434".to_owned()
            }
        );
        assert_eq!(ollama.spec.cwd.as_deref(), Some(Path::new("/srv/gringo")));
        assert_eq!(project.settings, SupervisorSettings::default());
    }

    #[test]
    fn test_empty_cmd() {
        let raw = raw_project(vec![("test", raw_service(&[]))]);
        assert!(raw.into_project(Path::new("test.toml")).is_err());

        let raw = raw_project(vec![("test", raw_service(&["echo", " "]))]);
        assert!(raw.into_project(Path::new("test.toml")).is_err());
    }

    #[test]
    fn test_zero_timeout() {
        let raw = raw_project(vec![(
            "test",
            RawService {
                timeout_secs: Some(0),
                ..raw_service(&["echo"])
            },
        )]);
        let err = raw.into_project(Path::new("test.toml")).unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn test_unknown_and_self_dependency() {
        let raw = raw_project(vec![
            (
                "a",
                RawService {
                    deps: Some(vec!["missing".to_owned()]),
                    ..raw_service(&["echo"])
                },
            ),
            (
                "b",
                RawService {
                    deps: Some(vec!["b".to_owned()]),
                    ..raw_service(&["echo"])
                },
            ),
        ]);
        let err = raw.into_project(Path::new("test.toml")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("unknown dependency `missing`"));
        assert!(message.contains("depends on itself"));
    }

    #[test]
    fn test_port_placeholder_without_port() {
        let raw = raw_project(vec![(
            "web",
            RawService {
                probe: Some(RawProbe::Tcp("127.0.0.1:{port}".to_owned())),
                ..raw_service(&["serve"])
            },
        )]);
        assert!(raw.into_project(Path::new("test.toml")).is_err());
    }

    #[test]
    fn test_external_needs_network_probe() {
        let raw = raw_project(vec![(
            "ollama",
            RawService {
                owned: Some(false),
                ..raw_service(&[])
            },
        )]);
        assert!(raw.into_project(Path::new("test.toml")).is_err());
    }
}
