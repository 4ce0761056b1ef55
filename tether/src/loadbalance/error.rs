use thiserror::Error;

use crate::BoxError;

#[derive(Error, Debug)]
pub enum LoadBalanceError {
    #[error("no available service instance")]
    NoAvailableService,
    #[error("missing caller ip for ip hash balance")]
    MissingCallerIp,
    #[error("service discovery failed: {0:?}")]
    Discover(#[from] BoxError),
}
