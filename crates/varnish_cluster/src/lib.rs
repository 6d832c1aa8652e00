pub mod api;
pub mod controllers;
pub mod util;
pub mod vcl;

#[cfg(test)]
pub mod fixtures;
