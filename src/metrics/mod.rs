pub mod change;
pub mod engine;
