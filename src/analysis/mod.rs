//! Numerical building blocks shared by the detectors.

pub mod model;
pub mod stats;
