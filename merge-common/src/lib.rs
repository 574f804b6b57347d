pub mod address;
pub mod classify;
pub mod error;
pub mod health;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod pool;
pub mod runs;
pub mod staging;
pub mod writer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
