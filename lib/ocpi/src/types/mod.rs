//! OCPI types for the versions and credentials modules

mod attempt;
mod credentials;
mod envelope;
mod ids;
mod peer;
mod response;
mod version;

pub use attempt::*;
pub use credentials::*;
pub use envelope::*;
pub use ids::*;
pub use peer::*;
pub use response::*;
pub use version::*;
