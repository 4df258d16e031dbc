pub mod status;

pub use status::{StatusState, status_routes};
