//! RPC API: dispatch router, services, HTTP surface.

pub mod app;
pub mod dispatch;
pub mod services;
