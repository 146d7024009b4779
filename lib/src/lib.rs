//! # Daemonless container image builds
//!
//! This crate assembles OCI/Docker images straight from application
//! artifacts (dependency archives, resources, compiled classes) and
//! pushes them to a registry, without a container daemon or runtime.
//! Inputs are partitioned into layers that change at different rates and
//! every layer is content-addressed and cached, so a repeat build uploads
//! only what actually changed.

#![deny(missing_docs)]
// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

pub mod blob;
pub mod builder;
pub mod cache;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod image;
pub mod registry;
pub mod tar;
pub mod timing;
