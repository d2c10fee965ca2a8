pub mod arbiter;
pub mod degausser;
pub mod handler;
pub mod magnetometer;
pub mod protocol;
