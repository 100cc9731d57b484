//! Sessions and the manager that ticks them.

pub mod manager;
#[allow(clippy::module_inception)]
pub mod session;

pub use manager::SessionManager;
pub use session::Session;
