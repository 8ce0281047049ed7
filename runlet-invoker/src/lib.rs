#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

pub mod api;
pub mod invoke;
pub mod kubernetes;
pub mod models;
pub mod token;
