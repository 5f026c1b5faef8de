pub(crate) mod af;
pub mod errors;
pub mod route;
pub mod stats;

pub use af::AddressFamily;
pub use route::{Route, RouteSpec};
