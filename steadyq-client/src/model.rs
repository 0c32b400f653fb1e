/// Sequence number of a successful connection. The first live connection of a client is
/// generation 1.
pub type GenerationId = u64;

/// Error codes in connection scope.
#[derive(Debug)]
pub enum ConnectionError {
    /// The server forced to close the connection.
    ConnectionForced = 320,
    /// The client tried to work with an invalid virtual host.
    InvalidPath = 402,
    /// The client tried to access a resource it didn't have access.
    AccessRefused = 403,
    /// The client tried to access a non-existing or not-opened channel.
    ChannelError = 504,
    /// The client tried to work with an entity in a way which is not allowed by the server.
    NotAllowed = 530,
    /// The server couldn't fulfill the request because of an intermittent error.
    InternalError = 541,
}

/// Error codes in channel scope.
#[derive(Debug)]
pub enum ChannelError {
    /// Denotes successful execution like connection or channel closed.
    Success = 200,
    /// The client tried to access a resource it didn't have access.
    AccessRefused = 403,
    /// Queue or entity cannot be found.
    NotFound = 404,
    /// The client cannot access a resource because another client is working on what.
    ResourceLocked = 405,
    /// The work on resource is refused mostly because of validation errors.
    PreconditionFailed = 406,
}

/// Queue survives a broker restart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Durable(pub bool);
/// Only the declaring connection may use the queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Exclusive(pub bool);
/// Queue is deleted when its last consumer goes away.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AutoDelete(pub bool);
/// Don't wait for the server to answer the method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoWait(pub bool);
/// Messages are acknowledged by the server as soon as they are delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoAck(pub bool);
/// Specify if the server sends messages to the same connection which published them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoLocal(pub bool);
/// Return the message if it cannot be routed to a queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mandatory(pub bool);
/// Return the message if it cannot be delivered to a consumer immediately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Immediate(pub bool);
