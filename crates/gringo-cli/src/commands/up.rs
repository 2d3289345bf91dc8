use std::{process::ExitCode, time::Duration};

use anyhow::{anyhow, Result};
use gringo_core::{
    CancellationToken, ServiceState, Supervisor, SupervisorEvent, UnixProcessManager,
};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
    time::timeout,
};

use crate::logger::Logger;

/// Exit code after an interrupted startup, as for a shell killed by SIGINT.
const INTERRUPTED: u8 = 130;
/// How long to keep printing output of stopped services before exiting.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub async fn run(file: Option<String>, services: Vec<String>) -> Result<ExitCode> {
    let project = super::load_project(file)?;
    let order = project.startup_order(&services)?;

    let (supervisor, events) = Supervisor::new(UnixProcessManager::new(), project.settings);
    for name in &order {
        let service = project
            .services
            .get(name)
            .ok_or_else(|| anyhow!("Service {name} not found"))?;
        supervisor.register(service.spec.clone())?;
    }

    let printer = tokio::spawn(print_events(events));
    let mut interrupts = signal(SignalKind::interrupt())?;
    let mut logger = Logger::stdout();

    let mut interrupted = false;
    let mut failed_required = false;

    for name in &order {
        let Some(service) = project.services.get(name) else {
            continue;
        };

        let blocked = service.deps.iter().find(|dep| {
            supervisor
                .status(dep)
                .map_or(true, |status| status.state != ServiceState::Ready)
        });
        if let Some(dep) = blocked {
            logger.error(&format!("Skipping {name}: dependency {dep} is not ready"));
            if service.required {
                failed_required = true;
                break;
            }
            continue;
        }

        let cancel = CancellationToken::new();
        let start = supervisor.start_with_cancel(name, cancel.clone());
        tokio::pin!(start);

        let state = tokio::select! {
            state = &mut start => state?,
            _ = interrupts.recv() => {
                interrupted = true;
                cancel.cancel();
                start.await?
            }
        };
        logger.status(&supervisor.status(name)?);

        if interrupted {
            break;
        }
        if state.is_failed() && service.required {
            logger.error(&format!("Required service {name} failed to start"));
            failed_required = true;
            break;
        }
    }

    if !interrupted && !failed_required {
        logger.system("All services started, press Ctrl+C to stop");
        interrupts.recv().await;
    }

    logger.system("Stopping services...");
    let report = tokio::select! {
        report = supervisor.stop_all() => report,
        _ = interrupts.recv() => {
            tracing::warn!("Second Ctrl+C: exiting immediately");
            return Ok(ExitCode::FAILURE);
        }
    };
    for err in &report.failures {
        logger.error(&err.to_string());
    }

    drop(supervisor);
    if timeout(DRAIN_TIMEOUT, printer).await.is_err() {
        tracing::debug!("Output still open after shutdown");
    }

    if interrupted {
        Ok(ExitCode::from(INTERRUPTED))
    } else if failed_required || !report.is_ok() {
        Ok(ExitCode::FAILURE)
    } else {
        logger.system("All services stopped");
        Ok(ExitCode::SUCCESS)
    }
}

async fn print_events(mut events: mpsc::Receiver<SupervisorEvent>) {
    let mut logger = Logger::stdout();
    while let Some(event) = events.recv().await {
        match event {
            SupervisorEvent::Log {
                service, message, ..
            } => logger.log(&service, &message),
            SupervisorEvent::StateChanged {
                service,
                state: state @ ServiceState::Stopped { .. },
            } => logger.system(&format!("{service} {state}")),
            SupervisorEvent::StateChanged { .. } => {}
        }
    }
}
