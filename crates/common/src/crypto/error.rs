/// Failure taxonomy shared by every cryptographic operation.
///
/// All failures are terminal for the input at hand: callers never receive
/// partial plaintext or a default value alongside one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// AEAD tag mismatch: ciphertext, associated data, nonce or key is wrong
    #[error("authentication failure")]
    AuthenticationFailure,
    /// Input does not have the shape the operation expects
    #[error("malformed input: {0}")]
    MalformedInput(&'static str),
    /// An envelope carried a sequence number other than the expected one
    #[error("replay detected: expected sequence {expected}, got {got}")]
    ReplayDetected { expected: u64, got: u64 },
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported envelope algorithm {0}")]
    UnsupportedAlgorithm(u32),
}
