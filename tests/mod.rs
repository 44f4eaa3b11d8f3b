mod common;
mod pool_tests;
