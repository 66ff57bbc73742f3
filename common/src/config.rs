pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Width in bytes of the extra-nonce-2 advertised in the mining.subscribe
// result. Miners use it to size their local nonce space.
pub const EXTRA_NONCE2_SIZE: u8 = 8;

// Hard limit on the hex-encoded extra-nonce-2 accepted in a submit
// to bound per-share allocation
pub const MAX_EXTRA_NONCE2_HEX_LENGTH: usize = 128;

// Hard cap on a single protocol line (one JSON object plus newline).
// Anything larger is not a well-formed stratum message.
pub const MAX_LINE_SIZE: usize = 8 * 1024;
