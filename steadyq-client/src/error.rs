use std::fmt;

/// Represents an error raised by the client itself (and not by the transport). Transport errors
/// are passed through as they are, so they can be downcasted to their own types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientError {
    /// AMQP reply code, see [`crate::ConnectionError`] and [`crate::ChannelError`].
    pub code: u16,
    pub message: String,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientError")
            .field("code", &self.code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for ClientError {}

/// Shorthand for creating errors in async functions.
#[macro_export]
macro_rules! client_error {
    ($code:expr, $message:expr) => {
        ::std::result::Result::Err(anyhow::Error::new($crate::ClientError {
            code: $code as u16,
            message: ::std::string::String::from($message),
        }))
    };
}
