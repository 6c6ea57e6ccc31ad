pub mod model;
pub mod repository;
pub mod state;
pub mod tier_engine;
