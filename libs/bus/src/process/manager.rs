//! Process Manager
//!
//! Owns the private socket directory and the set of live worker pids. Only
//! the root bus has one; worker processes hold nothing but their socket.
//!
//! Spawn handshake:
//!
//! ```text
//! parent: bind <dir>/<name>-<epoch>.sock ─▶ spawn worker program
//! worker: connect ─────────────────────────▶ parent: accept, unlink socket
//! parent: Bootstrap ───────────────────────▶ worker: construct + initialize
//! worker: Ready | Failed ──────────────────▶ parent
//! ```

use super::protocol::{Bootstrap, ChildFrame, ParentFrame, CHILD_SOCKET_ENV};
use crate::error::{BusError, Result};
use bus_config::BusConfig;
use codec::{FrameReader, FrameWriter};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACCEPT_POLL: Duration = Duration::from_millis(5);
const REAP_POLL: Duration = Duration::from_millis(5);

/// A worker process that completed the handshake
pub(crate) struct ChildConnection {
    pub child: Child,
    pub stream: UnixStream,
    pub writer: FrameWriter<UnixStream>,
}

pub(crate) struct ProcessManager {
    socket_dir: PathBuf,
    dir_created: Mutex<bool>,
    children: Mutex<HashMap<u32, String>>,
    alive: AtomicBool,
}

impl ProcessManager {
    pub fn new(config: &BusConfig) -> Self {
        let unique = Uuid::new_v4().simple().to_string();
        let socket_dir = config
            .socket_dir()
            .join(format!("messaging-bus-{}-{}", std::process::id(), &unique[..8]));
        Self {
            socket_dir,
            dir_created: Mutex::new(false),
            children: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    pub fn live_children(&self) -> usize {
        self.children.lock().len()
    }

    fn ensure_dir(&self) -> io::Result<()> {
        let mut created = self.dir_created.lock();
        if !*created {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&self.socket_dir)?;
            *created = true;
        }
        Ok(())
    }

    /// Launch a worker process and complete the handshake
    pub fn spawn(&self, bootstrap: &Bootstrap, config: &BusConfig) -> Result<ChildConnection> {
        let name = bootstrap.name.as_str();
        if !self.is_alive() {
            return Err(BusError::ShuttingDown);
        }
        self.ensure_dir()
            .map_err(|e| BusError::spawn_with_source(name, "create socket directory", e))?;

        let socket_path = self
            .socket_dir
            .join(format!("{}-{}.sock", sanitize(name), bootstrap.epoch));
        let _ = fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| BusError::spawn_with_source(name, "bind worker socket", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| BusError::spawn_with_source(name, "configure worker socket", e))?;

        let program = match &config.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|e| BusError::spawn_with_source(name, "locate worker program", e))?,
        };

        // Own process group: a terminal interrupt reaches only the parent,
        // which then stops workers in order
        let mut child = Command::new(&program)
            .env(CHILD_SOCKET_ENV, &socket_path)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                let _ = fs::remove_file(&socket_path);
                BusError::spawn_with_source(name, format!("spawn {:?}", program), e)
            })?;

        let outcome = self.handshake(&listener, &mut child, bootstrap, config);
        let _ = fs::remove_file(&socket_path);

        match outcome {
            Ok((stream, writer)) => {
                self.children.lock().insert(child.id(), name.to_string());
                info!(component = %name, pid = child.id(), program = ?program, "Worker process ready");
                Ok(ChildConnection {
                    child,
                    stream,
                    writer,
                })
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    fn handshake(
        &self,
        listener: &UnixListener,
        child: &mut Child,
        bootstrap: &Bootstrap,
        config: &BusConfig,
    ) -> Result<(UnixStream, FrameWriter<UnixStream>)> {
        let name = bootstrap.name.as_str();
        let deadline = Instant::now() + config.child_connect_timeout();

        let stream = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(BusError::spawn(
                            name,
                            format!("worker exited before connecting ({})", status),
                        ));
                    }
                    if Instant::now() >= deadline {
                        return Err(BusError::spawn(name, "worker did not connect in time"));
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(BusError::spawn_with_source(name, "accept worker", e)),
            }
        };

        let io_err =
            |what: &'static str| move |e: io::Error| BusError::spawn_with_source(name, what, e);
        stream.set_nonblocking(false).map_err(io_err("configure worker link"))?;
        let mut writer = FrameWriter::new(
            stream.try_clone().map_err(io_err("clone worker link"))?,
            config.max_frame_size,
        );
        writer
            .send(&ParentFrame::Bootstrap(bootstrap.clone()))
            .map_err(|e| BusError::transport("send bootstrap", e))?;

        stream
            .set_read_timeout(Some(config.child_connect_timeout()))
            .map_err(io_err("configure worker link"))?;
        let mut reader = FrameReader::new(
            stream.try_clone().map_err(io_err("clone worker link"))?,
            config.max_frame_size,
        );
        match reader.recv::<ChildFrame>() {
            Ok(ChildFrame::Ready) => {}
            Ok(ChildFrame::Failed { message }) => return Err(BusError::construct(name, message)),
            Ok(other) => {
                return Err(BusError::spawn(
                    name,
                    format!("unexpected handshake frame {:?}", other),
                ))
            }
            Err(e) => return Err(BusError::transport("await worker ready", e)),
        }
        stream.set_read_timeout(None).map_err(io_err("configure worker link"))?;

        Ok((stream, writer))
    }

    /// Wait for a cooperative exit, then escalate to SIGTERM and SIGKILL
    ///
    /// Returns whether the process is gone.
    pub fn escalate(&self, name: &str, child: &mut Child, config: &BusConfig) -> bool {
        if wait_child(child, config.process_join_timeout()) {
            self.forget(child.id());
            debug!(component = %name, pid = child.id(), "Worker process exited");
            return true;
        }
        warn!(component = %name, pid = child.id(), "Worker process did not exit, terminating");
        self.terminate(name, child, config)
    }

    /// SIGTERM, then SIGKILL, each followed by a bounded wait
    pub fn terminate(&self, name: &str, child: &mut Child, config: &BusConfig) -> bool {
        let pid = child.id();
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(component = %name, pid, error = %e, "SIGTERM failed");
        }
        if wait_child(child, config.terminate_join_timeout()) {
            self.forget(pid);
            return true;
        }

        warn!(component = %name, pid, "Worker process ignored SIGTERM, killing");
        let _ = child.kill();
        if wait_child(child, config.kill_join_timeout()) {
            self.forget(pid);
            return true;
        }
        error!(component = %name, pid, "Worker process survived SIGKILL");
        false
    }

    fn forget(&self, pid: u32) {
        self.children.lock().remove(&pid);
    }

    /// SIGKILL every worker still on record
    pub fn kill_all(&self) -> usize {
        let children: Vec<(u32, String)> = self.children.lock().drain().collect();
        for (pid, name) in &children {
            warn!(component = %name, pid, "Killing worker process");
            let _ = signal::kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
        }
        children.len()
    }

    /// Refuse further spawns and remove the socket directory
    pub fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        if *self.dir_created.lock() {
            if let Err(e) = fs::remove_dir_all(&self.socket_dir) {
                debug!(dir = ?self.socket_dir, error = %e, "Socket directory not removed");
            }
        }
        info!("Process manager shut down");
    }
}

/// Poll `try_wait` until the child exits or `timeout` passes
fn wait_child(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() >= deadline => return false,
            Ok(None) => thread::sleep(REAP_POLL),
            // Already reaped elsewhere
            Err(_) => return true,
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_names_are_filesystem_safe() {
        assert_eq!(sanitize("db/main worker"), "db_main_worker");
        assert_eq!(sanitize(&"x".repeat(100)).len(), 32);
    }

    #[test]
    fn test_private_directory_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let config = BusConfig {
            socket_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let manager = ProcessManager::new(&config);
        assert!(manager.socket_dir().starts_with(tmp.path()));
        manager.ensure_dir().unwrap();

        let mode = fs::metadata(manager.socket_dir()).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(mode.mode() & 0o777, 0o700);

        manager.shutdown();
        assert!(!manager.is_alive());
        assert!(!manager.socket_dir().exists());
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = BusConfig {
            socket_dir: Some(tmp.path().to_path_buf()),
            worker_program: Some(tmp.path().join("no-such-program")),
            ..Default::default()
        };
        let manager = ProcessManager::new(&config);
        let bootstrap = Bootstrap {
            name: "db".into(),
            class: "Database".into(),
            args: types::Args::new(),
            stream_enabled: false,
            epoch: 1,
            config: config.clone(),
        };
        let err = manager.spawn(&bootstrap, &config).err().unwrap();
        assert!(matches!(err, BusError::Spawn { .. }), "{:?}", err);
        assert_eq!(manager.live_children(), 0);
    }
}
