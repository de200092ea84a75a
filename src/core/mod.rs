pub mod apply;
pub mod asv;
pub mod config;
pub mod controller;
pub mod engine;
pub mod lock;
pub mod sampler;
pub mod table;
