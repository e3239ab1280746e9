// src/manager/tests/mod.rs
//! Tests for the request pipeline
