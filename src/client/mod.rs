mod client;
mod structs;

pub use client::SpClient;
pub use structs::*;
