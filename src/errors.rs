// =============================================================================
// Error taxonomy — every variant carries a stable kind identifier
// =============================================================================
//
// Propagation policy:
//   - Transport / protocol errors are handled inside the owning adapter
//     (reconnect, resync) and never reach order callers.
//   - Market / account / authorization errors propagate to the calling API.
//   - Capacity errors surface as explicit HTTP / WS responses.
//   - Config errors are fatal at startup.
// =============================================================================

use thiserror::Error;

/// Domain error for the broker core. `kind()` returns the stable identifier
/// surfaced to callers and logged with every occurrence.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Config ──────────────────────────────────────────────────────────
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("missing credential: {0}")]
    MissingCredential(String),

    // ── Transport ───────────────────────────────────────────────────────
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("read error: {0}")]
    ReadError(String),
    #[error("write error: {0}")]
    WriteError(String),
    #[error("authentication rejected by provider: {0}")]
    AuthRejected(String),
    #[error("outgoing sequence number below provider expectation: {0}")]
    SequenceTooLow(String),

    // ── Protocol ────────────────────────────────────────────────────────
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("session fatal: {0}")]
    SessionFatal(String),

    // ── Market ──────────────────────────────────────────────────────────
    #[error("no liquidity for {0}")]
    NoLiquidity(String),
    #[error("stale price for {0}")]
    StalePrice(String),
    #[error("symbol suspended: {0}")]
    SymbolSuspended(String),
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    // ── Account ─────────────────────────────────────────────────────────
    #[error("insufficient margin: required {required:.2}, free {free:.2}")]
    InsufficientMargin { required: f64, free: f64 },
    #[error("invalid volume {volume}: {reason}")]
    InvalidVolume { volume: f64, reason: String },
    #[error("account suspended: {0}")]
    AccountSuspended(String),
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    #[error("account in margin call")]
    MarginCall,
    #[error("stop out triggered")]
    StopOut,
    #[error("order not found: {0}")]
    OrderNotFound(String),
    #[error("position not found: {0}")]
    PositionNotFound(String),

    // ── Capacity ────────────────────────────────────────────────────────
    #[error("server busy, retry later")]
    ServerBusy,
    #[error("slow consumer")]
    SlowConsumer,

    // ── Authorization ───────────────────────────────────────────────────
    #[error("authentication required")]
    AuthRequired,
    #[error("forbidden")]
    Forbidden,
    #[error("token expired")]
    TokenExpired,
    #[error("rate limited")]
    RateLimited,

    // ── Misc ────────────────────────────────────────────────────────────
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable kind identifier.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::MissingCredential(_) => "MissingCredential",
            Self::ConnectFailed(_) => "ConnectFailed",
            Self::ReadError(_) => "ReadError",
            Self::WriteError(_) => "WriteError",
            Self::AuthRejected(_) => "AuthRejected",
            Self::SequenceTooLow(_) => "SequenceTooLow",
            Self::MalformedMessage(_) => "MalformedMessage",
            Self::UnexpectedMessage(_) => "UnexpectedMessage",
            Self::SessionFatal(_) => "SessionFatal",
            Self::NoLiquidity(_) => "NoLiquidity",
            Self::StalePrice(_) => "StalePrice",
            Self::SymbolSuspended(_) => "SymbolSuspended",
            Self::UnknownSymbol(_) => "UnknownSymbol",
            Self::InsufficientMargin { .. } => "InsufficientMargin",
            Self::InvalidVolume { .. } => "InvalidVolume",
            Self::AccountSuspended(_) => "AccountSuspended",
            Self::UnknownAccount(_) => "UnknownAccount",
            Self::MarginCall => "MarginCall",
            Self::StopOut => "StopOut",
            Self::OrderNotFound(_) => "OrderNotFound",
            Self::PositionNotFound(_) => "PositionNotFound",
            Self::ServerBusy => "ServerBusy",
            Self::SlowConsumer => "SlowConsumer",
            Self::AuthRequired => "AuthRequired",
            Self::Forbidden => "Forbidden",
            Self::TokenExpired => "TokenExpired",
            Self::RateLimited => "RateLimited",
            Self::Timeout(_) => "Timeout",
            Self::Internal(_) => "Internal",
        }
    }

    /// Whether an adapter seeing this error may retry the connection.
    /// `AuthRejected` and `SequenceTooLow` require operator intervention.
    pub fn is_retryable_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_)
                | Self::ReadError(_)
                | Self::WriteError(_)
                | Self::Timeout(_)
                | Self::MalformedMessage(_)
                | Self::UnexpectedMessage(_)
                | Self::SessionFatal(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
