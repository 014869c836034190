//! Runtime environment selection.

/// Environment variable selecting the runtime environment.
pub const SAUTI_ENV: &str = "SAUTI_ENV";

/// Environment variable overriding the HTTP listen port.
pub const SAUTI_SERVER_HTTP_PORT: &str = "SAUTI_SERVER_HTTP_PORT";

/// Environment variable overriding the gRPC listen port.
pub const SAUTI_SERVER_GRPC_PORT: &str = "SAUTI_SERVER_GRPC_PORT";

/// Environment variable overriding the models cache directory.
pub const SAUTI_MODELS_PATH: &str = "SAUTI_MODELS_PATH";

/// Environment variable overriding the config directory.
pub const SAUTI_CONFIG_PATH: &str = "SAUTI_CONFIG_PATH";

/// The environment a gateway instance runs in.
///
/// Controls log verbosity and output format; everything else behaves the
/// same in both environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Env {
    #[default]
    Development,
    Production,
}

impl Env {
    /// Parse an environment name. Unrecognized values fall back to
    /// `Development`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Env::Production,
            _ => Env::Development,
        }
    }

    /// Read the environment from `SAUTI_ENV`.
    pub fn from_env() -> Self {
        match std::env::var(SAUTI_ENV) {
            Ok(val) if !val.is_empty() => Env::parse(&val),
            _ => Env::Development,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Env::Development => "development",
            Env::Production => "production",
        }
    }
}

impl std::fmt::Display for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names() {
        assert_eq!(Env::parse("dev"), Env::Development);
        assert_eq!(Env::parse("development"), Env::Development);
        assert_eq!(Env::parse("prod"), Env::Production);
        assert_eq!(Env::parse("Production"), Env::Production);
        assert_eq!(Env::parse(" PRODUCTION "), Env::Production);
    }

    #[test]
    fn unknown_falls_back_to_development() {
        assert_eq!(Env::parse("staging"), Env::Development);
        assert_eq!(Env::parse(""), Env::Development);
    }

    #[test]
    fn display_names() {
        assert_eq!(Env::Development.to_string(), "development");
        assert_eq!(Env::Production.to_string(), "production");
    }
}
