pub mod client;
pub mod poke;
pub mod replica;
pub mod service;
pub mod updater;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;
