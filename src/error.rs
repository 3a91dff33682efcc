#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("payload of {len} bytes exceeds MAX_PAYLOAD ({max})")]
    PayloadTooLarge { len: usize, max: usize },
}
