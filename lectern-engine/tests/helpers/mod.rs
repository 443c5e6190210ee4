//! Shared fixtures for lectern-engine integration tests

#![allow(dead_code)]

pub mod media_fixtures;
