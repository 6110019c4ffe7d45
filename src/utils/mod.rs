pub mod billing;
pub mod sse;
