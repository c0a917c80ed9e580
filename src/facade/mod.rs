mod engine;

pub use engine::{ProcessEngine, ProcessEngineBuilder};
