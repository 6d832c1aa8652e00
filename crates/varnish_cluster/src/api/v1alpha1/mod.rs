pub mod varnishcluster;

pub use varnishcluster::*;
