use derive_more::Display;
use reqwest::StatusCode;

#[derive(Debug, Display)]
pub enum CatalogError {
    #[display("catalog responded {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[display("catalog still responded {status} after {attempts} attempts: {body}")]
    RetriesExhausted {
        status: StatusCode,
        body: String,
        attempts: u32,
    },
    #[display("network error after {attempts} attempts: {source}")]
    Network { source: reqwest::Error, attempts: u32 },
    #[display("unable to build http client: {_0}")]
    Build(reqwest::Error),
    #[display("invalid client configuration: {_0}")]
    Config(String),
    #[display("unexpected catalog payload: {_0}")]
    UnexpectedPayload(String),
    #[display("unable to decode catalog response: {_0}")]
    Json(serde_json::Error),
    #[display("request cancelled")]
    Cancelled,
}

impl std::error::Error for CatalogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Network { source, .. } => Some(source),
            Self::Build(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl CatalogError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
