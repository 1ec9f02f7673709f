use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,
    #[error("Record already exists")]
    Conflict,
    #[error("Store backend failure: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication required. Please provide a valid access token")]
    MissingToken,
    #[error("Token have bad format. Please provide a valid token")]
    BadFormat,
    #[error("Token is not recognized")]
    InvalidToken,
}

impl warp::reject::Reject for AuthError {}

/// Failures reported back to the connection that caused them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Payload is malformed: {0}")]
    BadPayload(String),
    #[error("Unknown event type: {0}")]
    UnknownEvent(String),
    #[error("Internal server error")]
    Store(#[from] StoreError),
    #[error("Room does not exist")]
    RoomNotFound,
    #[error("Room is private")]
    RoomPrivate,
    #[error("Room is invite only")]
    RoomInviteOnly,
    #[error("User is already a room member")]
    AlreadyMember,
    #[error("User is not a room member")]
    NotMember,
    #[error("Room admin role required")]
    NotAdmin,
    #[error("Invalid room members: {0}")]
    InvalidMembers(String),
    #[error("Room name is already taken")]
    RoomNameTaken,
    #[error("User does not exist: {0}")]
    UserNotFound(String),
}

impl ChatError {
    pub fn code(&self) -> u16 {
        match self {
            ChatError::BadPayload(_) => 1,
            ChatError::UnknownEvent(_) => 2,
            ChatError::Store(_) => 3,
            ChatError::RoomNotFound => 10,
            ChatError::RoomPrivate => 11,
            ChatError::RoomInviteOnly => 12,
            ChatError::AlreadyMember => 13,
            ChatError::NotMember => 14,
            ChatError::NotAdmin => 15,
            ChatError::InvalidMembers(_) => 16,
            ChatError::RoomNameTaken => 17,
            ChatError::UserNotFound(_) => 18,
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::BadPayload(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read accounts file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse accounts file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("TLS requires both a certificate and a private key")]
    IncompleteTls,
}
