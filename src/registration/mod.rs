mod heartbeat;
mod registrar;


pub use registrar::Registrar;

/// Lifecycle phase of a [`Registrar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unregistered,
    Registering,
    Registered,
    RegistrationFailed,
    Stopped,
}
