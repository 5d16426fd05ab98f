/// Errors raised by the policy core.
///
/// Every variant aborts the enclosing training or inference call; nothing in
/// this crate retries.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Configuration rejected at construction time.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A batch field required by the called path is absent.
    #[error("Missing batch field `{0}`")]
    MissingField(&'static str),

    /// Offsets, lengths or tensor shapes disagree with each other.
    #[error("Malformed batch: {0}")]
    MalformedBatch(String),

    /// A declared mode that has no implementation on this path.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// The diffusion context needs one pooled vector per sample.
    #[error("Diffusion context requires txt_reduce = \"attn\"")]
    TxtReduceRequired,

    /// Reading tensor data back to the host failed.
    #[error("Tensor data error: {0}")]
    Data(String),
}

pub type Result<T> = std::result::Result<T, PolicyError>;
