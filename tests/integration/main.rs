#[path = "../helpers/mod.rs"]
mod helpers;

mod durability;
mod file_io;
mod namespace;
