mod apply;
mod error;

pub use apply::UpgradeApply;
pub use error::UpgradeError;

pub trait UpgradeInfo {
    type Info: AsRef<str> + Clone;
    type InfoIter: Iterator<Item = Self::Info>;

    fn protocol_info(&self) -> Self::InfoIter;
}

/// A protocol upgrade applied once its protocol id has been negotiated.
pub trait Upgrade<S>: UpgradeInfo {
    type Output;
    type Error;
    type Future: Future<Output = Result<Self::Output, Self::Error>>;

    /// Upgrades a stream accepted from the remote.
    fn upgrade_inbound(self, stream: S, info: Self::Info) -> Self::Future;

    /// Upgrades a stream we dialed.
    fn upgrade_outbound(self, stream: S, info: Self::Info) -> Self::Future;
}
