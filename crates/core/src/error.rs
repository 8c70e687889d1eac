use thiserror::Error;

/// Error classes callers branch on. Anything else travels as `Internal`.
#[derive(Debug, Error)]
pub enum MdaiError {
    /// Temp file or local IO failure; always fatal.
    #[error("setup: {0}")]
    Setup(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic-concurrency rejection from the resource API.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("conflict retries exhausted after {attempts} attempts: {last}")]
    ConflictExhausted { attempts: u32, last: String },
    /// Business-rule rejection, already translated to a user-facing message when recognized.
    #[error("validation: {0}")]
    Validation(String),
    #[error("cancelled")]
    Cancelled,
    #[error("internal: {0}")]
    Internal(String),
}

pub type MdaiResult<T> = Result<T, MdaiError>;

impl MdaiError {
    pub fn is_not_found(&self) -> bool { matches!(self, MdaiError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, MdaiError::Conflict(_)) }

    /// Recover a typed error from an `anyhow` chain, wrapping anything else as `Internal`.
    pub fn from_anyhow(e: anyhow::Error) -> Self {
        match e.downcast::<MdaiError>() {
            Ok(me) => me,
            Err(e) => MdaiError::Internal(format!("{:#}", e)),
        }
    }
}

impl From<std::io::Error> for MdaiError {
    fn from(e: std::io::Error) -> Self { MdaiError::Setup(e.to_string()) }
}

impl From<serde_yaml::Error> for MdaiError {
    fn from(e: serde_yaml::Error) -> Self { MdaiError::Internal(format!("yaml: {}", e)) }
}

impl From<serde_json::Error> for MdaiError {
    fn from(e: serde_json::Error) -> Self { MdaiError::Internal(format!("json: {}", e)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_roundtrip_keeps_class() {
        let e = anyhow::Error::new(MdaiError::NotFound("release x".into()));
        assert!(MdaiError::from_anyhow(e).is_not_found());
        let e = anyhow::anyhow!("boom").context("while doing y");
        match MdaiError::from_anyhow(e) {
            MdaiError::Internal(s) => assert!(s.contains("while doing y: boom"), "s={}", s),
            other => panic!("unexpected {:?}", other),
        }
    }
}
