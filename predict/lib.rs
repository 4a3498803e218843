#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod adapters;
pub mod config;
pub mod convert;
pub mod graph;
pub mod matrix;
pub mod native;
pub mod normalize;
pub mod patch;
pub mod runner;
pub mod types;
