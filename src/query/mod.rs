pub mod condition;
pub mod compiler;
pub mod estimator;
pub mod planner;
pub mod types;
