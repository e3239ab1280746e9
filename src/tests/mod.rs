// src/tests/mod.rs
//! Tests for the top-level rate limiter directory

mod rate_limiter_tests;
