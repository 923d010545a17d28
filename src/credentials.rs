//! Caster credentials
use base64::{engine::general_purpose, Engine};

#[cfg(doc)]
use crate::NtripClient;

/// Default User-Agent sent to casters
pub const DEFAULT_USER_AGENT: &str = concat!(
    "NTRIP ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION")
);

/// [NtripCredentials] handed to [NtripClient]s before init.
///
/// When `use_auth` is false the user and password are ignored and no
/// `Authorization` header is sent.
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NtripCredentials {
    /// Send Basic authentication to the caster
    #[cfg_attr(
        feature = "clap",
        clap(long = "ntrip-auth", env = "NTRIP_AUTH", default_value_t = false)
    )]
    pub use_auth: bool,

    /// Username for the NTRIP service
    #[cfg_attr(
        feature = "clap",
        clap(long = "ntrip-user", env = "NTRIP_USER", default_value = "")
    )]
    pub user: String,

    /// Password for the NTRIP service
    #[cfg_attr(
        feature = "clap",
        clap(long = "ntrip-pass", env = "NTRIP_PASS", default_value = "")
    )]
    pub pass: String,

    /// User-Agent announced to the caster
    #[cfg_attr(
        feature = "clap",
        clap(long = "ntrip-user-agent", env = "NTRIP_USER_AGENT", default_value = DEFAULT_USER_AGENT)
    )]
    pub user_agent: String,
}

impl Default for NtripCredentials {
    fn default() -> Self {
        Self {
            use_auth: false,
            user: String::new(),
            pass: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl NtripCredentials {
    /// Credentials that authenticate with `user` and `password`
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            use_auth: true,
            user: user.to_string(),
            pass: password.to_string(),
            ..Default::default()
        }
    }

    /// Copies and returns updated [NtripCredentials]
    pub fn with_username(&self, username: &str) -> Self {
        let mut s = self.clone();
        s.user = username.to_string();
        s.use_auth = true;
        s
    }

    /// Copies and returns updated [NtripCredentials]
    pub fn with_password(&self, password: &str) -> Self {
        let mut s = self.clone();
        s.pass = password.to_string();
        s.use_auth = true;
        s
    }

    /// Copies and returns [NtripCredentials] with a custom User-Agent
    pub fn with_user_agent(&self, user_agent: &str) -> Self {
        let mut s = self.clone();
        s.user_agent = user_agent.to_string();
        s
    }

    /// Base64 of `user:pass`, as used in the Basic `Authorization` header
    pub fn encode(&self) -> String {
        general_purpose::STANDARD.encode(format!("{}:{}", self.user, self.pass))
    }

    /// `Authorization` header value, if authentication is in use
    pub fn basic_auth(&self) -> Option<String> {
        self.use_auth.then(|| format!("Basic {}", self.encode()))
    }
}
