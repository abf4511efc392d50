use std::io;

use meshwire_stream_select::NegotiationError;

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError<E> {
    #[error(transparent)]
    Select(#[from] NegotiationError),
    #[error(transparent)]
    Apply(E),
}

impl From<UpgradeError<io::Error>> for io::Error {
    fn from(err: UpgradeError<io::Error>) -> Self {
        match err {
            UpgradeError::Select(e) => e.into(),
            UpgradeError::Apply(e) => e,
        }
    }
}
