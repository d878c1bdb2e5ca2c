pub mod config;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod params;
pub mod raw_request;
pub mod server;
pub mod storage;
