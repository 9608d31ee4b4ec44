pub mod fixture;
pub mod shared;

pub use fixture::{TestPlanner, at, init_tracing};
pub use shared::SharedDatabase;
