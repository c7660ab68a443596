//! Readers for Linux `/proc` files.

pub mod mountinfo;
