//! Process-wide registry of live sessions.
//!
//! The registry supports a status dump on demand and a graceful shutdown
//! that cancels every session's transport and waits for termination. A
//! small signal reader task maps the user signal to the status dump and
//! termination signals to the full shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Session lifecycle states visible through the registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Reset,
    Ready,
    Closing,
    Final,
}

/// What a registered task is doing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Client,
    Server,
    Listener,
}

struct Slot {
    kind: SessionKind,
    peer: Option<SocketAddr>,
    state: Lifecycle,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

/// Handle given to a registered session. The receiver trips when a
/// shutdown has been requested.
pub struct Ticket {
    pub id: u64,
    pub shutdown: watch::Receiver<bool>,
}

/// The registry itself. Insert, iterate and delete all hold the mutex.
#[derive(Default)]
pub struct Registry {
    slots: Mutex<HashMap<u64, Slot>>,
    counter: AtomicU64,
}

impl Registry {
    /// The process-wide registry instance.
    pub fn global() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(Registry::default)
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<u64, Slot>> {
        self.slots.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Adds a session and hands back its ticket.
    pub fn register(&self, kind: SessionKind, peer: Option<SocketAddr>) -> Ticket {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(false);
        self.slots().insert(
            id,
            Slot {
                kind,
                peer,
                state: Lifecycle::Reset,
                shutdown: sender,
                handle: None,
            },
        );
        Ticket {
            id,
            shutdown: receiver,
        }
    }

    pub fn set_state(&self, id: u64, state: Lifecycle) {
        if let Some(slot) = self.slots().get_mut(&id) {
            slot.state = state;
        }
    }

    /// Records the join handle of a spawned session so a shutdown can wait
    /// for it.
    pub fn attach(&self, id: u64, handle: JoinHandle<()>) {
        if let Some(slot) = self.slots().get_mut(&id) {
            slot.handle = Some(handle);
        }
    }

    pub fn deregister(&self, id: u64) {
        self.slots().remove(&id);
    }

    /// Writes one status line per live session to stderr.
    pub fn status(&self) {
        let slots = self.slots();
        for slot in slots.values() {
            match slot.peer {
                Some(peer) => eprintln!(
                    "Status: {:?} Host({peer}) [{:?}]",
                    slot.state, slot.kind
                ),
                None => eprintln!("Status: {:?} Host(UNKNOWN) [{:?}]", slot.state, slot.kind),
            }
        }
    }

    /// Moves every session to Closing, cancels its transport by dropping
    /// the session future, and waits for task termination. A second call
    /// after sessions reached Final is a no-op.
    pub async fn notify_all(&self) {
        let mut handles = Vec::new();
        {
            let mut slots = self.slots();
            for (id, slot) in slots.iter_mut() {
                if slot.state == Lifecycle::Final {
                    continue;
                }
                slot.state = Lifecycle::Closing;
                let _ = slot.shutdown.send(true);
                if let Some(handle) = slot.handle.take() {
                    handles.push((*id, handle));
                }
            }
        }

        for (id, handle) in handles {
            if let Err(err) = handle.await {
                tracing::error!(session = id, %err, "session task failed");
            }
            self.set_state(id, Lifecycle::Final);
        }
    }
}

/// Spawns the signal reader: the user signal dumps session status, a
/// termination signal shuts every session down. A broken pipe is left to
/// surface as an I/O error on the transport, where the normal-close path
/// swallows it.
#[cfg(unix)]
pub fn spawn_signal_reader() -> JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let Ok(mut terminate) = signal(SignalKind::terminate()) else {
            tracing::error!("cannot install SIGTERM handler");
            return;
        };
        let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
            tracing::error!("cannot install SIGINT handler");
            return;
        };
        let Ok(mut user2) = signal(SignalKind::user_defined2()) else {
            tracing::error!("cannot install SIGUSR2 handler");
            return;
        };

        loop {
            tokio::select! {
                _ = terminate.recv() => {
                    tracing::info!("SIGTERM received");
                    Registry::global().notify_all().await;
                    return;
                }
                _ = interrupt.recv() => {
                    tracing::info!("SIGINT received");
                    Registry::global().notify_all().await;
                    return;
                }
                _ = user2.recv() => {
                    Registry::global().status();
                }
            }
        }
    })
}

#[cfg(not(unix))]
pub fn spawn_signal_reader() -> JoinHandle<()> {
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            Registry::global().notify_all().await;
        }
    })
}
