// =============================================================================
// FIX 4.4 provider session
// =============================================================================

pub mod adapter;
pub mod codec;
pub mod session;

pub use adapter::FixAdapter;
