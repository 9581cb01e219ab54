//! Bounded headless-browser page pool and the network-intercepting
//! renderer built on top of it (spec §4.7, §4.8).

pub mod pool;
pub mod renderer;

pub use pool::{BrowserPool, BrowserPoolConfig, PageHandle, PoolError, PoolStats};
pub use renderer::{PageRenderer, RenderOptions};
