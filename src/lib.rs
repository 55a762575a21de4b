//! `meshd`: daemon wrapper around the mesh node library.

pub mod config;
pub mod logging;

pub use meshd_mesh as mesh;
