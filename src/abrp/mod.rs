//! Client side of the Iternio / A Better Route Planner API.
//!
//! The API is documented at [Iternio][iternio-docs]. Only the tiny subset
//! needed by this service is implemented in [api::IternioApiHandler]:
//!
//! - `tlm/get_telemetry`, polled by the
//!   [TelemetryCoordinator](crate::coordinator::TelemetryCoordinator),
//! - `tlm/send`, used by the send-telemetry service,
//! - `oauth/me`, `oauth/auth` and `oauth/token`, used while creating a config
//!   entry (see [crate::config_flow]).
//!
//! Every request carries a fixed timeout so a hanging API cannot stall a poll
//! cycle.
//!
//! [iternio-docs]: https://documenter.getpostman.com/view/7396339/SWTK5a8w

pub mod api;
pub mod error;

pub use api::{Credentials, IternioApiHandler};
pub use error::{AbrpError, AbrpResult};

/// Shortens a secret for logging: `abcdefghijkl` becomes `abcd...ijkl`.
pub fn simplify_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "...".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
