//! Server load measurement

pub mod load;

pub use load::{FixedLoad, LoadMonitor, LoadSample, LoadSource};
