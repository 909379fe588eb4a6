// TCP server and main loop.
//
// Architecture: thread-per-connection around one shared `AlertSystem`.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and sends `ServerEvent::NewConnection` to the main thread.
// - **Main thread**: spawns a session thread per connection (see
//   `session.rs`) and, using `recv_timeout` as its timer, releases delayed
//   sensor alerts and option changes once a second.
// - **Session threads**: each owns one socket and talks to the shared
//   `AlertSystem` through its lock.
//
// Shutdown: `ServerHandle::stop` clears `keep_running`. The listener, the main
// loop and every running session notice within one poll interval. A session
// can also be blocked reading its peer's authentication, so the main thread
// shuts down every session's socket before joining the session threads.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use watchpost_protocol::types::unix_now;

use crate::auth::CredentialStore;
use crate::config::ServerConfig;
use crate::session::{self, SessionContext};
use crate::sync::{AlertSystem, LogNotifier, Notifier, SharedSystem};

/// How often delayed alerts and options are checked.
const TICK: Duration = Duration::from_secs(1);

/// Events sent from the listener thread to the main thread.
enum ServerEvent {
    NewConnection {
        stream: TcpStream,
        peer: SocketAddr,
    },
}

/// A running session thread and a handle on its socket.
struct SessionThread {
    stream: TcpStream,
    thread: JoinHandle<()>,
}

/// Handle returned by `start_server` to control the running server.
pub struct ServerHandle {
    keep_running: Arc<AtomicBool>,
    system: SharedSystem,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The live alert system, for embedding processes and tests.
    pub fn system(&self) -> SharedSystem {
        self.system.clone()
    }

    /// Signal the server to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Start the server on a background thread. Returns a handle for stopping it
/// and the actual bound address (useful when port 0 is used to let the OS pick
/// a free port).
pub fn start_server<C>(
    config: ServerConfig,
    credentials: C,
) -> std::io::Result<(ServerHandle, SocketAddr)>
where
    C: CredentialStore + 'static,
{
    start_server_with(config, credentials, Box::new(LogNotifier))
}

/// `start_server` with a custom notifier for SMTP-activated alert levels.
pub fn start_server_with<C>(
    config: ServerConfig,
    credentials: C,
    notifier: Box<dyn Notifier>,
) -> std::io::Result<(ServerHandle, SocketAddr)>
where
    C: CredentialStore + 'static,
{
    let listener = TcpListener::bind((config.bind_addr.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let system = AlertSystem::from_config(&config)
        .with_notifier(notifier)
        .into_shared();

    let ctx = SessionContext {
        config: Arc::new(config),
        credentials: Arc::new(credentials),
        system: system.clone(),
        keep_running: keep_running.clone(),
    };
    let thread = thread::spawn(move || run_server(listener, ctx));
    log::info!("listening on {addr}");

    Ok((
        ServerHandle {
            keep_running,
            system,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Main server loop. Runs until `keep_running` is set to false.
fn run_server(listener: TcpListener, ctx: SessionContext) {
    let (tx, rx): (Sender<ServerEvent>, Receiver<ServerEvent>) = mpsc::channel();

    // Non-blocking so the accept thread can check keep_running periodically.
    if let Err(e) = listener.set_nonblocking(true) {
        log::error!("cannot make listener non-blocking: {e}");
        return;
    }

    let keep_running_listener = ctx.keep_running.clone();
    let listener_thread = thread::spawn(move || {
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        log::warn!("{peer}: dropping connection: {e}");
                        continue;
                    }
                    if tx.send(ServerEvent::NewConnection { stream, peer }).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    log::error!("accept failed: {e}");
                    break;
                }
            }
        }
    });

    let mut sessions: Vec<SessionThread> = Vec::new();
    while ctx.keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(TICK) {
            Ok(ServerEvent::NewConnection { stream, peer }) => {
                log::info!("{peer}: connected");
                let handle = match stream.try_clone() {
                    Ok(handle) => handle,
                    Err(e) => {
                        log::warn!("{peer}: dropping connection: {e}");
                        continue;
                    }
                };
                let session_ctx = ctx.clone();
                sessions.push(SessionThread {
                    stream: handle,
                    thread: thread::spawn(move || {
                        session::serve(stream, peer, session_ctx);
                    }),
                });
                sessions.retain(|s| !s.thread.is_finished());
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        ctx.system.lock().release_due(unix_now());
    }

    let _ = listener_thread.join();
    for session in &sessions {
        let _ = session.stream.shutdown(Shutdown::Both);
    }
    for session in sessions {
        let _ = session.thread.join();
    }
    log::info!("server stopped");
}
