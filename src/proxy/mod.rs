pub mod admission;
pub mod auth;
pub mod dispatch;
pub mod handlers;
pub mod providers;
pub mod recorder;
pub mod request;
