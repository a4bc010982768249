pub mod memory;
pub mod postgres;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;
