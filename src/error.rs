use thiserror::Error;

/// Errors the reconciler distinguishes. Everything that reaches
/// [`kube::runtime::controller::Controller`] as `Err` triggers a backoff requeue;
/// everything handled internally (config/secret `NotFound`, write `Conflict`) is
/// swallowed and logged at the call site instead of bubbling up here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kube API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("no templates dir: looked in 'templates' and '../templates'")]
    NoTemplatesDir,

    #[error("failed to read workload template {path}: {source}")]
    TemplateRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workload template: {0}")]
    TemplateParse(#[from] serde_yaml::Error),

    #[error("sosreport {namespace}/{name} has no uid")]
    MissingUid { namespace: String, name: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
