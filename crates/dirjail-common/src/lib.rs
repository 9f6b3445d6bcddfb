//! # dirjail-common
//!
//! Shared error definitions and configuration models used across the
//! dirjail workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and provides the foundational primitives that the
//! resolution engine builds upon.

pub mod config;
pub mod error;
