use std::{
    collections::HashMap,
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Stdio},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use futures::StreamExt;
use libc::{killpg, setsid, SIGKILL, SIGTERM};
use parking_lot::Mutex;
use tokio::{
    process::{Child, Command},
    time::{sleep, Instant},
};
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::{
    error::{Error, Result},
    process_manager::{
        base::ProcessManager,
        types::{CommandSpec, ProcId, Spawned},
    },
};

const MAX_LINE_LENGTH: usize = 64 * 1024;
const WAIT_STEP: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct ChildRec {
    child: Child,
    pgid: libc::pid_t,
    exit: Option<i32>,
}

/// Unix-specific process manager. Every child becomes the leader of a new
/// session so signals reach the whole process tree.
#[derive(Debug)]
pub struct UnixProcessManager {
    next_id: AtomicU64,
    processes: Mutex<HashMap<ProcId, ChildRec>>,
}

impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixProcessManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn exit_code(status: ExitStatus) -> i32 {
        status
            .code()
            .or_else(|| status.signal().map(|signal| 128 + signal))
            .unwrap_or_default()
    }

    /// Non-blocking exit check.
    fn poll_exit(&self, id: ProcId) -> Result<Option<i32>> {
        let mut processes = self.processes.lock();
        let rec = processes
            .get_mut(&id)
            .ok_or(Error::UnknownProcess(id.0))?;

        if rec.exit.is_none() {
            if let Some(status) = rec.child.try_wait()? {
                rec.exit = Some(Self::exit_code(status));
            }
        }

        Ok(rec.exit)
    }

    fn signal_group(&self, id: ProcId, signal: libc::c_int) -> Result<()> {
        let pgid = self
            .processes
            .lock()
            .get(&id)
            .map(|rec| rec.pgid)
            .ok_or(Error::UnknownProcess(id.0))?;

        #[allow(unsafe_code)]
        let rc = unsafe { killpg(pgid, signal) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            // The whole group is already gone.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(Error::IOError(err));
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl ProcessManager for UnixProcessManager {
    async fn spawn(&self, spec: CommandSpec) -> Result<Spawned> {
        let Some((program, args)) = spec.cmd.split_first() else {
            return Err(Error::ProcessSpawn {
                service: spec.name,
                reason: "empty cmd".to_owned(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(&spec.env);

        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(|| {
                if setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| Error::ProcessSpawn {
            service: spec.name.clone(),
            reason: err.to_string(),
        })?;

        let pid = child.id();
        let pgid = pid
            .and_then(|pid| libc::pid_t::try_from(pid).ok())
            .ok_or_else(|| Error::IOError(std::io::Error::other("pid not available")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::IOError(std::io::Error::other("stdout not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::IOError(std::io::Error::other("stderr not piped")))?;

        let out_stream =
            FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
                .filter_map(|res| async move { res.ok() });
        let err_stream =
            FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
                .filter_map(|res| async move { res.ok() });

        let id = ProcId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.processes.lock().insert(
            id,
            ChildRec {
                child,
                pgid,
                exit: None,
            },
        );

        tracing::debug!("Spawned `{}` as pid {pgid} ({id:?})", spec.name);

        Ok(Spawned {
            id,
            pid,
            stdout: Box::pin(out_stream),
            stderr: Box::pin(err_stream),
        })
    }

    async fn shutdown(&self, id: ProcId) -> Result<()> {
        self.signal_group(id, SIGTERM)
    }

    async fn wait(&self, id: ProcId, d: Duration) -> Result<Option<i32>> {
        let start = Instant::now();
        loop {
            if let Some(code) = self.poll_exit(id)? {
                return Ok(Some(code));
            }

            let elapsed = start.elapsed();
            if elapsed >= d {
                return Ok(None);
            }
            sleep(WAIT_STEP.min(d - elapsed)).await;
        }
    }

    async fn kill(&self, id: ProcId) -> Result<()> {
        self.signal_group(id, SIGKILL)?;

        let _ = self.wait(id, Duration::from_millis(10)).await;
        Ok(())
    }

    fn release(&self, id: ProcId) {
        self.processes.lock().remove(&id);
    }
}
