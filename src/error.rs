use thiserror::Error;

/// Errors that application code may want to react to specifically. They are raised through
///  `anyhow` and can be recovered with `err.downcast_ref::<MultipathError>()`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum MultipathError {
    /// There is no subflow left to carry data, or the connection was closed explicitly
    #[error("connection closed")]
    ConnectionClosed,

    /// A read or write deadline elapsed before the operation could complete
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("subflow closed")]
    SubflowClosed,
}

/// Result of an attempt to put a frame on a subflow's outbound queue
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,
    #[error("subflow is closed")]
    Closed,
}

impl MultipathError {
    /// convenience for checking an `anyhow::Error` against a specific variant
    pub fn is(err: &anyhow::Error, expected: MultipathError) -> bool {
        err.downcast_ref::<MultipathError>() == Some(&expected)
    }
}
