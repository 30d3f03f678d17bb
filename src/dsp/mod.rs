//! Signal-processing primitives shared by the heart and breathing estimators

pub mod filters;
pub mod spectrum;
pub mod spline;
pub mod stats;

pub use filters::{Biquad, SosFilter};
pub use spectrum::Spectrum;
pub use spline::CubicSpline;
