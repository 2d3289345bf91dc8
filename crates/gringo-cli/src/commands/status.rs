use std::process::ExitCode;

use anyhow::Result;
use colored::Colorize;
use gringo_config::Service;
use gringo_core::{build_probe, ProbeContext};
use gringo_types::{expand_port, PortSpec, ProbeSpec};
use serde::Serialize;

use crate::logger::Logger;

#[derive(Debug, Serialize)]
struct ServiceCheck {
    name: String,
    target: String,
    /// `None` when the service can only be checked through a process the
    /// supervisor owns.
    reachable: Option<bool>,
    required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ServiceCheck {
    fn is_failure(&self) -> bool {
        self.required && self.reachable == Some(false)
    }
}

/// Probe every configured service once, without starting anything.
pub async fn run(file: Option<String>, json: bool) -> Result<ExitCode> {
    let project = super::load_project(file)?;
    let order = project.startup_order(&[])?;

    let mut checks = Vec::with_capacity(order.len());
    for name in &order {
        if let Some(service) = project.services.get(name) {
            checks.push(check(service).await);
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&checks)?);
    } else {
        let mut logger = Logger::stdout();
        for check in &checks {
            let state = match check.reachable {
                Some(true) => "reachable".green(),
                Some(false) => "unreachable".red(),
                None => "unknown".bright_black(),
            };
            let mut line = format!("{:<16} {state}  {}", check.name, check.target);
            if let Some(error) = &check.error {
                line.push_str(&format!("  ({error})"));
            }
            logger.system(&line);
        }
    }

    if checks.iter().any(ServiceCheck::is_failure) {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn check(service: &Service) -> ServiceCheck {
    let spec = &service.spec;
    // Without a running supervisor an allocated port is unknown; the first
    // candidate is the best guess.
    let port = spec.port.map(|port| match port {
        PortSpec::Fixed(port) | PortSpec::Allocate { from: port } => port,
    });

    let mut check = ServiceCheck {
        name: spec.name.clone(),
        target: match &spec.probe {
            ProbeSpec::Tcp { address } => expand_port(address, port),
            ProbeSpec::Http { url } => expand_port(url, port),
            ProbeSpec::ProcessAlive => "process".to_owned(),
        },
        reachable: None,
        required: service.required,
        error: None,
    };

    if spec.probe == ProbeSpec::ProcessAlive {
        return check;
    }

    match build_probe(spec, port) {
        Ok(probe) => {
            let result =
                tokio::time::timeout(spec.probe_timeout, probe.probe(&ProbeContext::default()))
                    .await;
            check.reachable = Some(result.is_ok_and(|result| result.success));
        }
        Err(err) => {
            check.reachable = Some(false);
            check.error = Some(err.to_string());
        }
    }

    check
}
