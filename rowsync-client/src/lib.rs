pub mod poke;
pub mod runner;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;
