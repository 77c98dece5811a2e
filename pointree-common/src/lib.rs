#![deny(unused_must_use)]

pub mod attributes;
pub mod chunking;
pub mod converter;
pub mod encoding;
pub mod geometry;
pub mod las;
pub mod index;
pub mod status;
pub mod utils;

pub use nalgebra;
