use std::net::UdpSocket;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;

use tracing::{debug, info, warn};

use tessella_network::{mem_fabric, Fabric, Mailbox, Message, TcpRoot};
use tessella_worker::run_worker;

use crate::error::SolveError;

/// Where the pooled workers live.
#[derive(Debug, Clone)]
pub enum PoolBackend {
    /// Dedicated threads of this process over the in-memory fabric.
    Threads,
    /// Spawned worker processes over TCP. Entries of the hostfile are
    /// reached with ssh; missing or `localhost` entries spawn locally.
    Processes {
        worker_bin: PathBuf,
        hostfile: Option<PathBuf>,
    },
}

enum Handles {
    Threads(Vec<thread::JoinHandle<()>>),
    Processes(Vec<Child>),
}

/// A reusable set of solver workers. The pool outlives a single solve:
/// workers idle in their command loop between tasks, so repeated calls
/// (as in a dictionary-learning outer loop) pay the spawn cost once.
pub struct WorkerPool {
    world: usize,
    mailbox: Mailbox<Box<dyn Fabric>>,
    handles: Handles,
}

impl WorkerPool {
    pub async fn spawn(world: usize, backend: &PoolBackend) -> Result<Self, SolveError> {
        match backend {
            PoolBackend::Threads => Self::spawn_threads(world),
            PoolBackend::Processes {
                worker_bin,
                hostfile,
            } => Self::spawn_processes(world, worker_bin, hostfile.as_deref()).await,
        }
    }

    fn spawn_threads(world: usize) -> Result<Self, SolveError> {
        let (root, workers) = mem_fabric(world);
        let mut handles = Vec::with_capacity(world);
        for fabric in workers {
            let rank = fabric.rank();
            let handle = thread::Builder::new()
                .name(format!("tessella-worker-{rank}"))
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_time()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            warn!(rank, "worker runtime failed to start: {err}");
                            return;
                        }
                    };
                    if let Err(err) = runtime.block_on(run_worker(fabric)) {
                        warn!(rank, "worker stopped with error: {err}");
                    }
                })
                .map_err(SolveError::Spawn)?;
            handles.push(handle);
        }
        info!(world, "worker pool running on threads");
        Ok(Self {
            world,
            mailbox: Mailbox::new(Box::new(root) as Box<dyn Fabric>),
            handles: Handles::Threads(handles),
        })
    }

    async fn spawn_processes(
        world: usize,
        worker_bin: &std::path::Path,
        hostfile: Option<&std::path::Path>,
    ) -> Result<Self, SolveError> {
        let hosts: Vec<String> = match hostfile {
            Some(path) => std::fs::read_to_string(path)
                .map_err(SolveError::Spawn)?
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from)
                .collect(),
            None => Vec::new(),
        };
        let any_remote = hosts.iter().any(|h| !is_local_host(h));
        let bind: std::net::SocketAddr = if any_remote {
            "0.0.0.0:0".parse().expect("static address")
        } else {
            "127.0.0.1:0".parse().expect("static address")
        };
        let root = TcpRoot::bind(bind).await?;
        let port = root.local_addr().port();
        let advertised = if any_remote {
            format!("{}:{port}", local_ip().map_err(SolveError::Spawn)?)
        } else {
            format!("127.0.0.1:{port}")
        };

        let mut children = Vec::with_capacity(world);
        for rank in 0..world {
            let host = if hosts.is_empty() {
                None
            } else {
                Some(hosts[rank % hosts.len()].as_str())
            };
            let mut command = match host {
                Some(host) if !is_local_host(host) => {
                    let mut ssh = Command::new("ssh");
                    ssh.arg(host)
                        .arg(worker_bin.display().to_string())
                        .arg("--connect")
                        .arg(&advertised);
                    ssh
                }
                _ => {
                    let mut local = Command::new(worker_bin);
                    local.arg("--connect").arg(&advertised);
                    local
                }
            };
            let child = command
                .stdin(Stdio::null())
                .spawn()
                .map_err(SolveError::Spawn)?;
            debug!(rank, pid = child.id(), ?host, "spawned worker process");
            children.push(child);
        }

        let fabric = root.accept_workers(world).await?;
        info!(world, "worker pool running on processes");
        Ok(Self {
            world,
            mailbox: Mailbox::new(Box::new(fabric) as Box<dyn Fabric>),
            handles: Handles::Processes(children),
        })
    }

    pub fn world(&self) -> usize {
        self.world
    }

    pub fn mailbox(&mut self) -> &mut Mailbox<Box<dyn Fabric>> {
        &mut self.mailbox
    }

    /// Asks every worker to leave and waits for them.
    pub async fn shutdown(mut self) -> Result<(), SolveError> {
        let _ = self.mailbox.bcast(Message::Shutdown).await;
        match std::mem::replace(&mut self.handles, Handles::Threads(Vec::new())) {
            Handles::Threads(handles) => {
                for handle in handles {
                    let _ = handle.join();
                }
            }
            Handles::Processes(mut children) => {
                for child in &mut children {
                    let _ = child.wait();
                }
            }
        }
        debug!("worker pool shut down");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Handles::Processes(children) = &mut self.handles {
            for child in children {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// The address this machine is reachable at from the workers' hosts.
fn local_ip() -> std::io::Result<std::net::IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("10.254.254.254:1")?;
    Ok(socket.local_addr()?.ip())
}
