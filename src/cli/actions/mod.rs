pub mod server;

use crate::config::ServerConfig;

#[derive(Debug)]
pub enum Action {
    /// Serve the CAS, OIDC, SAML and actuator endpoints.
    Serve(ServerConfig),
}

impl Action {
    /// # Errors
    /// Returns an error if the server cannot start or stops with a failure.
    pub async fn execute(self) -> anyhow::Result<()> {
        match self {
            Self::Serve(config) => server::execute(config).await,
        }
    }
}
