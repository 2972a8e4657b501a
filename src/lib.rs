pub mod api;
pub mod config;
pub mod error;
pub mod registration;
pub mod registry;
pub mod signals;
pub mod utils;

pub use api::ServiceInstance;
pub use config::RegistrarConfig;
pub use error::{CallError, RegistrarError};
pub use registration::{Phase, Registrar};
pub use registry::{RegistryClient, TransportKind};

pub fn init_env() {
    dotenv::dotenv().ok();
}
