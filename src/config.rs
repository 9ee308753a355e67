//! Command-line configuration.
//!
//! Positional arguments: `<token> <local-path> <remote-path> [<password>]`.
//! An empty or absent password disables encryption, which also drops the
//! archive suffix from remote paths.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub token: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub password: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum UsageError {
    WrongArgumentCount,
    EmptyToken,
    EmptyLocalPath,
}

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsageError::WrongArgumentCount => write!(f, "expected 3 or 4 arguments"),
            UsageError::EmptyToken => write!(f, "access token must not be empty"),
            UsageError::EmptyLocalPath => write!(f, "local path must not be empty"),
        }
    }
}

pub fn usage(program: &str) -> String {
    format!("usage: {program} <token> <local-path> <remote-path> [<password>]")
}

impl Config {
    pub fn from_args(args: &[String]) -> Result<Self, UsageError> {
        if args.len() < 3 || args.len() > 4 {
            return Err(UsageError::WrongArgumentCount);
        }

        let token = args[0].trim().to_string();
        if token.is_empty() {
            return Err(UsageError::EmptyToken);
        }
        if args[1].is_empty() {
            return Err(UsageError::EmptyLocalPath);
        }

        let password = args
            .get(3)
            .map(|p| p.to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            token,
            local_path: PathBuf::from(&args[1]),
            remote_path: normalize_remote_path(&args[2]),
            password,
        })
    }

    pub fn encrypt(&self) -> bool {
        self.password.is_some()
    }
}

/// Normalize a remote path: forward slashes, leading slash, no trailing
/// slash; the service addresses its root as the empty string
fn normalize_remote_path(raw: &str) -> String {
    let forward = raw.replace('\\', "/");
    let trimmed = forward.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_four_arguments_with_password() {
        let config = Config::from_args(&args(&["tok", "/data", "/Backup", "secret"])).unwrap();
        assert_eq!(config.token, "tok");
        assert_eq!(config.local_path, PathBuf::from("/data"));
        assert_eq!(config.remote_path, "/Backup");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert!(config.encrypt());
    }

    #[test]
    fn empty_password_disables_encryption() {
        let config = Config::from_args(&args(&["tok", "/data", "/Backup", ""])).unwrap();
        assert!(config.password.is_none());
        assert!(!config.encrypt());

        let config = Config::from_args(&args(&["tok", "/data", "/Backup"])).unwrap();
        assert!(!config.encrypt());
    }

    #[test]
    fn rejects_bad_arity_and_empty_token() {
        assert_eq!(
            Config::from_args(&args(&["tok", "/data"])),
            Err(UsageError::WrongArgumentCount)
        );
        assert_eq!(
            Config::from_args(&args(&["tok", "a", "b", "c", "d"])),
            Err(UsageError::WrongArgumentCount)
        );
        assert_eq!(
            Config::from_args(&args(&["  ", "/data", "/r"])),
            Err(UsageError::EmptyToken)
        );
    }

    #[test]
    fn remote_path_normalization() {
        assert_eq!(normalize_remote_path("/Backup/"), "/Backup");
        assert_eq!(normalize_remote_path("Backup\\Photos"), "/Backup/Photos");
        assert_eq!(normalize_remote_path("/"), "");
        assert_eq!(normalize_remote_path(""), "");
    }
}
