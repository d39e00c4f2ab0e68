//! Desired routing state and its translation into cache entries.

pub mod route_set;
pub mod translator;

pub use route_set::{
    load_route_sets, parse_route_sets, Backend, HostRule, PathRule, RouteSet, TlsTermination,
    Visibility,
};
pub use translator::Translator;
