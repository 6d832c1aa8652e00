use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio::time::Duration;

#[derive(Error, Debug)]
pub enum StdError {
    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    /// A prerequisite does not exist yet. Callers requeue instead of failing.
    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("IoError: {context} {}: {source}", path.display())]
    IoError {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TemplateError: {0}")]
    TemplateError(#[source] minijinja::Error),

    #[error("CommandError: {0}")]
    CommandError(String),

    #[error("VclCompilationError: {0}")]
    VclCompilationError(String),

    #[error("VclReloadError: {0}")]
    VclReloadError(String),
}

impl StdError {
    pub fn metric_label(&self) -> String {
        let label = match self {
            StdError::JsonSerializationError(_) => "jsonserializationerror",
            StdError::KubeError(_) => "kubeerror",
            StdError::FinalizerError(_) => "finalizererror",
            StdError::MetadataMissing(_) => "metadatamissing",
            StdError::InvalidArgument(_) => "invalidargument",
            StdError::NotFound(_) => "notfound",
            StdError::IoError { .. } => "ioerror",
            StdError::TemplateError(_) => "templateerror",
            StdError::CommandError(_) => "commanderror",
            StdError::VclCompilationError(_) => "vclcompilationerror",
            StdError::VclReloadError(_) => "vclreloaderror",
        };
        label.to_string()
    }

    /// True when the API server rejected a write because of a stale resourceVersion.
    pub fn is_conflict(&self) -> bool {
        match self {
            StdError::KubeError(e) => is_kube_conflict(e),
            StdError::FinalizerError(e) => match e.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(inner)
                | kube::runtime::finalizer::Error::CleanupFailed(inner) => inner.is_conflict(),
                kube::runtime::finalizer::Error::AddFinalizer(e)
                | kube::runtime::finalizer::Error::RemoveFinalizer(e) => is_kube_conflict(e),
                _ => false,
            },
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            StdError::NotFound(_) => true,
            StdError::KubeError(kube::Error::Api(ae)) => ae.code == 404,
            StdError::FinalizerError(e) => match e.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(inner)
                | kube::runtime::finalizer::Error::CleanupFailed(inner) => inner.is_not_found(),
                _ => false,
            },
            _ => false,
        }
    }
}

pub fn is_kube_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == 409)
}

#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> ErrorWithRequeue {
        ErrorWithRequeue { error, duration }
    }

    pub fn metric_label(&self) -> String {
        self.error.metric_label()
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.metric_label(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.inner().is_conflict()
    }

    pub fn is_not_found(&self) -> bool {
        self.inner().is_not_found()
    }

    pub fn inner(&self) -> &StdError {
        match self {
            Error::StdError(e) => e,
            Error::ErrorWithRequeue(e) => &e.error,
        }
    }
}

impl From<StdError> for Error {
    fn from(error: StdError) -> Self {
        Error::StdError(error)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn conflict_is_classified_through_wrappers() {
        let err = Error::StdError(StdError::KubeError(api_error(409, "Conflict")));
        assert!(err.is_conflict());
        assert!(!err.is_not_found());

        let requeue = Error::ErrorWithRequeue(ErrorWithRequeue::new(
            StdError::KubeError(api_error(409, "Conflict")),
            Duration::from_secs(1),
        ));
        assert!(requeue.is_conflict());
    }

    #[test]
    fn not_found_signal_and_api_404_are_both_not_found() {
        assert!(Error::from(StdError::NotFound("no active vcl".into())).is_not_found());
        assert!(Error::from(StdError::KubeError(api_error(404, "NotFound"))).is_not_found());
        assert!(!Error::from(StdError::InvalidArgument("ports".into())).is_not_found());
    }

    #[test]
    fn metric_labels_do_not_leak_messages() {
        let err = Error::from(StdError::VclCompilationError("line 3: syntax".into()));
        assert_eq!(err.metric_label(), "vclcompilationerror");
    }
}
