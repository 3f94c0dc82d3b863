//! Library integration tests, run against real store servers.

mod blocking_tests;
mod install_tests;
mod property_tests;
