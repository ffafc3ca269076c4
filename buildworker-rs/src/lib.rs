//! Build Worker Base Crate
//!
//! This crate contains the shared type definitions and the provisioning logic
//! for a single build worker host: the domain resolution strategies, the
//! reverse-proxy configuration and machine-init document synthesis, and the
//! planner that declares every cloud resource the worker needs. It does not
//! talk to any cloud API itself; resource creation is delegated to an
//! implementation of [`provider::Provider`].

pub mod cloud_init;
pub mod config;
pub mod domain;
pub mod engine;
pub mod image;
pub mod output;
pub mod perimeter;
pub mod plan;
pub mod provider;
pub mod proxy_config;
pub mod replacement;
pub mod resources;
pub mod secrets;
