use std::fmt;
use thiserror::Error;

/// Point in the fetch cycle where a portal failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Bootstrap,
    SignIn,
    Confirm,
    Redeem,
    Download,
    Parse,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Bootstrap => "bootstrap",
            Stage::SignIn => "sign-in",
            Stage::Confirm => "confirm",
            Stage::Redeem => "redeem",
            Stage::Download => "download",
            Stage::Parse => "parse",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Network,
    Parse,
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("authentication failed at {stage}: {detail}")]
    Authentication { stage: Stage, detail: String },

    #[error("network error at {stage}: {detail}")]
    Network { stage: Stage, detail: String },

    #[error("unexpected portal response at {stage}: {detail}")]
    Parse { stage: Stage, detail: String },
}

impl PortalError {
    pub fn authentication(stage: Stage, detail: impl Into<String>) -> Self {
        Self::Authentication {
            stage,
            detail: detail.into(),
        }
    }

    pub fn network(stage: Stage, detail: impl Into<String>) -> Self {
        Self::Network {
            stage,
            detail: detail.into(),
        }
    }

    pub fn parse(stage: Stage, detail: impl Into<String>) -> Self {
        Self::Parse {
            stage,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PortalError::Authentication { .. } => ErrorKind::Authentication,
            PortalError::Network { .. } => ErrorKind::Network,
            PortalError::Parse { .. } => ErrorKind::Parse,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            PortalError::Authentication { stage, .. }
            | PortalError::Network { stage, .. }
            | PortalError::Parse { stage, .. } => *stage,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Portal(#[from] PortalError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_error_reports_kind_and_stage() {
        let err = PortalError::authentication(Stage::SignIn, "HTTP 400");
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.stage(), Stage::SignIn);
        assert_eq!(err.to_string(), "authentication failed at sign-in: HTTP 400");
    }

    #[test]
    fn app_error_wraps_portal_error_transparently() {
        let err: AppError = PortalError::parse(Stage::Parse, "missing column 'Read Value'").into();
        assert_eq!(
            err.to_string(),
            "unexpected portal response at parse: missing column 'Read Value'"
        );
    }
}
