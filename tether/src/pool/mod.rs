//! Multi-tier connection pooling.
//!
//! A [`ServicePool`] keeps a small fleet of transports for one service id,
//! hands each call the least-loaded usable one, grows under pressure up to a
//! cap and reaps idle or unhealthy entries down to a floor. The
//! [`PoolRegistry`] maps service ids to pools and runs the background reaper
//! that also retires whole pools once they sit empty long enough.

pub mod conn;
pub mod registry;
mod service;

use thiserror::Error;

pub use conn::{ConnState, MakeTransport, TcpMakeTransport, TcpTransport, Transport};
pub use registry::{PoolConfig, PoolRegistry};
pub use service::{Handle, PooledTransport, ServicePool};

use crate::{loadbalance::error::LoadBalanceError, BoxError};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no healthy connections in pool")]
    NoHealthyConnections,
    #[error("connection pool is closed")]
    Closed,
    #[error("downstream unavailable: {0}")]
    UnavailableDownstream(#[source] BoxError),
    #[error(transparent)]
    LoadBalance(#[from] LoadBalanceError),
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use futures::future::BoxFuture;

    use super::{
        conn::{StateCell, Transport},
        ConnState, MakeTransport, PoolError,
    };

    /// Transport with externally driven state, for pool tests.
    pub(crate) struct TestConn {
        state: Arc<StateCell>,
    }

    impl Transport for TestConn {
        fn state(&self) -> ConnState {
            self.state.get()
        }

        fn state_changed(&self, current: ConnState) -> BoxFuture<'_, ConnState> {
            Box::pin(self.state.wait_change(current))
        }

        fn shutdown(&self) {
            self.state.set(ConnState::Shutdown);
        }
    }

    /// Counts dials; can be told to fail.
    #[derive(Default)]
    pub(crate) struct TestMaker {
        made: AtomicUsize,
        fail: AtomicBool,
        states: parking_lot::Mutex<Vec<Arc<StateCell>>>,
    }

    impl TestMaker {
        pub(crate) fn made(&self) -> usize {
            self.made.load(Ordering::SeqCst)
        }

        pub(crate) fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        /// State cell of the `index`-th dialed transport.
        pub(crate) fn state_of(&self, index: usize) -> Arc<StateCell> {
            self.states.lock()[index].clone()
        }
    }

    #[async_trait]
    impl MakeTransport for Arc<TestMaker> {
        type Conn = TestConn;

        async fn make_transport(&self) -> Result<TestConn, PoolError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PoolError::UnavailableDownstream("dial refused".into()));
            }
            self.made.fetch_add(1, Ordering::SeqCst);
            let state = Arc::new(StateCell::new(ConnState::Ready));
            self.states.lock().push(state.clone());
            Ok(TestConn { state })
        }
    }
}
