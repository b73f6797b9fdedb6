pub mod doctor;
pub mod geo;
pub mod heading;
pub mod navigator;
pub mod route;

pub use heading::{HeadingEstimate, HeadingEstimator};
pub use navigator::{Advice, NavParams, Navigator, Suggestion};
pub use route::{Route, RouteStep, Waypoint};
