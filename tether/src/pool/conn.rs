use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::{net::TcpStream, sync::Notify, time::timeout};

use super::PoolError;
use crate::net::Address;

/// Connectivity of a transport as the pool sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Ready,
    /// Failing but possibly recoverable; the health watcher grants a grace
    /// period before eviction.
    TransientFailure,
    /// Permanently closed.
    Shutdown,
}

/// A single transport connection.
///
/// The pool only needs a lightweight state predicate for selection and a way
/// to await transitions for its health watcher; what flows over the
/// connection is the caller's business.
pub trait Transport: Send + Sync + 'static {
    fn state(&self) -> ConnState;

    /// Resolves with the new state on the next transition away from
    /// `current`.
    fn state_changed(&self, current: ConnState) -> BoxFuture<'_, ConnState>;

    /// Begin teardown; the state becomes [`ConnState::Shutdown`].
    fn shutdown(&self);
}

/// Factory the pool calls when it decides to grow.
#[async_trait]
pub trait MakeTransport: Send + Sync + 'static {
    type Conn: Transport;

    async fn make_transport(&self) -> Result<Self::Conn, PoolError>;
}

/// Atomic [`ConnState`] with transition notification.
pub(crate) struct StateCell {
    state: AtomicU8,
    notify: Notify,
}

impl StateCell {
    pub(crate) fn new(initial: ConnState) -> Self {
        Self {
            state: AtomicU8::new(encode(initial)),
            notify: Notify::new(),
        }
    }

    pub(crate) fn get(&self) -> ConnState {
        decode(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, next: ConnState) {
        let prev = self.state.swap(encode(next), Ordering::SeqCst);
        if prev != encode(next) {
            self.notify.notify_waiters();
        }
    }

    pub(crate) async fn wait_change(&self, current: ConnState) -> ConnState {
        loop {
            // Arm the notification before re-checking to close the race
            // between the check and a concurrent `set`.
            let notified = self.notify.notified();
            let state = self.get();
            if state != current {
                return state;
            }
            notified.await;
        }
    }
}

fn encode(state: ConnState) -> u8 {
    match state {
        ConnState::Connecting => 0,
        ConnState::Ready => 1,
        ConnState::TransientFailure => 2,
        ConnState::Shutdown => 3,
    }
}

fn decode(raw: u8) -> ConnState {
    match raw {
        0 => ConnState::Connecting,
        1 => ConnState::Ready,
        2 => ConnState::TransientFailure,
        _ => ConnState::Shutdown,
    }
}

/// Plain TCP transport.
///
/// The stream starts [`ConnState::Ready`]; callers observing I/O trouble flag
/// it through [`TcpTransport::mark_transient_failure`] so the health watcher
/// can react, and [`TcpTransport::mark_ready`] clears the flag after a
/// successful exchange.
pub struct TcpTransport {
    peer: Address,
    state: Arc<StateCell>,
    stream: tokio::sync::Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    pub async fn connect(peer: Address, connect_timeout: Duration) -> Result<Self, PoolError> {
        let Address::Ip(sock) = peer;
        let stream = timeout(connect_timeout, TcpStream::connect(sock))
            .await
            .map_err(|_| {
                PoolError::UnavailableDownstream(Box::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {peer} timed out"),
                )))
            })?
            .map_err(|e| PoolError::UnavailableDownstream(Box::new(e)))?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            peer,
            state: Arc::new(StateCell::new(ConnState::Ready)),
            stream: tokio::sync::Mutex::new(Some(stream)),
        })
    }

    pub fn peer(&self) -> Address {
        self.peer
    }

    /// The underlying stream; `None` once the transport has shut down.
    pub fn stream(&self) -> &tokio::sync::Mutex<Option<TcpStream>> {
        &self.stream
    }

    pub fn mark_transient_failure(&self) {
        if self.state.get() != ConnState::Shutdown {
            self.state.set(ConnState::TransientFailure);
        }
    }

    pub fn mark_ready(&self) {
        if self.state.get() == ConnState::TransientFailure {
            self.state.set(ConnState::Ready);
        }
    }
}

impl Transport for TcpTransport {
    fn state(&self) -> ConnState {
        self.state.get()
    }

    fn state_changed(&self, current: ConnState) -> BoxFuture<'_, ConnState> {
        Box::pin(self.state.wait_change(current))
    }

    fn shutdown(&self) {
        self.state.set(ConnState::Shutdown);
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }
    }
}

/// Dials a fixed peer address; the building block for direct (non-resolved)
/// targets.
#[derive(Clone, Debug)]
pub struct TcpMakeTransport {
    peer: Address,
    connect_timeout: Duration,
}

impl TcpMakeTransport {
    pub fn new(peer: Address, connect_timeout: Duration) -> Self {
        Self {
            peer,
            connect_timeout,
        }
    }
}

#[async_trait]
impl MakeTransport for TcpMakeTransport {
    type Conn = TcpTransport;

    async fn make_transport(&self) -> Result<Self::Conn, PoolError> {
        TcpTransport::connect(self.peer, self.connect_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_cell_transitions() {
        let cell = Arc::new(StateCell::new(ConnState::Ready));
        assert_eq!(cell.get(), ConnState::Ready);

        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_change(ConnState::Ready).await })
        };
        tokio::task::yield_now().await;
        cell.set(ConnState::TransientFailure);
        assert_eq!(waiter.await.unwrap(), ConnState::TransientFailure);
    }

    #[tokio::test]
    async fn test_wait_change_returns_immediately_when_already_moved() {
        let cell = StateCell::new(ConnState::Shutdown);
        assert_eq!(cell.wait_change(ConnState::Ready).await, ConnState::Shutdown);
    }

    #[tokio::test]
    async fn test_tcp_connect_and_shutdown() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Address::Ip(listener.local_addr().unwrap());

        let transport = TcpTransport::connect(addr, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(transport.state(), ConnState::Ready);
        assert_eq!(transport.peer(), addr);

        transport.shutdown();
        assert_eq!(transport.state(), ConnState::Shutdown);
        assert!(transport.stream().try_lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused_is_unavailable() {
        // Bind-then-drop to get a port nothing is listening on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Address::Ip(listener.local_addr().unwrap());
        drop(listener);

        let result = TcpTransport::connect(addr, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PoolError::UnavailableDownstream(_))));
    }
}
