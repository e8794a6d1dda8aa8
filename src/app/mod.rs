pub mod errors;
pub mod factory;
pub mod service;
pub mod task_runner;

pub use errors::AppError;
pub use factory::{AppFactory, AppPaths};
pub use service::FaceService;
