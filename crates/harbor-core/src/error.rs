use harbor_proto::{ErrorBody, ErrorKind, ServiceId};
use harbor_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("session {0} is already open")]
    DuplicateSession(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("service {service_id} not found in session {session_id}")]
    ServiceNotFound {
        session_id: String,
        service_id: ServiceId,
    },
    #[error("no capacity: {0}")]
    NoCapacity(String),
    #[error("registration failed: {0}")]
    RegistrationFailed(String),
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),
    #[error("session {0} is shutting down")]
    SessionShuttingDown(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::DuplicateSession(_) => ErrorKind::DuplicateSession,
            ControlError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            ControlError::ServiceNotFound { .. } => ErrorKind::ServiceNotFound,
            ControlError::NoCapacity(_) => ErrorKind::NoCapacity,
            ControlError::RegistrationFailed(_) => ErrorKind::RegistrationFailed,
            ControlError::TransportFailure(_) => ErrorKind::TransportFailure,
            ControlError::SessionShuttingDown(_) => ErrorKind::SessionShuttingDown,
            ControlError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::DuplicateSession | ErrorKind::SessionShuttingDown => 409,
            ErrorKind::SessionNotFound | ErrorKind::ServiceNotFound => 404,
            ErrorKind::NoCapacity => 503,
            ErrorKind::RegistrationFailed | ErrorKind::TransportFailure => 502,
            ErrorKind::InvalidRequest => 400,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    pub fn service_not_found(session_id: &str, service_id: ServiceId) -> Self {
        ControlError::ServiceNotFound {
            session_id: session_id.to_string(),
            service_id,
        }
    }

    /// Rebuild the typed error a peer answered with.
    ///
    /// Only `UnexpectedStatus` responses that carry an [`ErrorBody`] are mapped back;
    /// anything else stays a transport failure. Remote `TransportFailure` bodies are
    /// kept as transport failures too, since the original cause is not recoverable.
    pub fn from_remote(err: TransportError) -> Self {
        let body = match &err {
            TransportError::UnexpectedStatus { body, .. } => {
                serde_json::from_str::<ErrorBody>(body).ok()
            }
            _ => None,
        };
        let Some(ErrorBody { kind, message }) = body else {
            return ControlError::TransportFailure(err);
        };
        match kind {
            ErrorKind::DuplicateSession => ControlError::DuplicateSession(message),
            ErrorKind::SessionNotFound => ControlError::SessionNotFound(message),
            ErrorKind::ServiceNotFound => ControlError::ServiceNotFound {
                session_id: message,
                service_id: 0,
            },
            ErrorKind::NoCapacity => ControlError::NoCapacity(message),
            ErrorKind::RegistrationFailed => ControlError::RegistrationFailed(message),
            ErrorKind::SessionShuttingDown => ControlError::SessionShuttingDown(message),
            ErrorKind::InvalidRequest => ControlError::InvalidRequest(message),
            ErrorKind::TransportFailure => ControlError::TransportFailure(err),
        }
    }
}
