pub mod bow;
pub mod drain;
pub mod prelude;
pub mod readiness;
pub mod signal;
pub mod strng;
pub mod telemetry;
pub mod version;
