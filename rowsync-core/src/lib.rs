pub mod cancel;
pub mod ident;
pub mod models;
pub mod storage;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;
