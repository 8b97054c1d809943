pub mod event;
pub mod log;
pub mod normalize;
pub mod relay;
pub mod runner;
pub mod service;
pub mod store;
pub mod tail;
