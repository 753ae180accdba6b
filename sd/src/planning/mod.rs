//! Request decomposition into TaskPlans

mod decomposer;

pub use decomposer::Decomposer;
