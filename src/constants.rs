// Used in the StartupMessage to indicate regular handshake.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196608;

// SSLRequest: used to indicate the client wants an SSL connection.
pub const SSL_REQUEST_CODE: i32 = 80877103;

// CancelRequest: the cancel request code.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

// GSSENCRequest: GSSAPI encryption is never offered.
pub const REQUEST_GSSENCMODE_CODE: i32 = 80877104;

// AuthenticationOk
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;
// AuthenticationCleartextPassword
pub const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;
// AuthenticationMD5Password
pub const MD5_ENCRYPTED_PASSWORD: i32 = 5;

pub const MD5_PASSWORD_PREFIX: &str = "md5";

// ErrorResponse: a code identifying the field type; if zero, this is the
// message terminator and no string follows.
pub const MESSAGE_TERMINATOR: u8 = 0;

// SQLSTATE codes, see Appendix A of the PostgreSQL documentation.
pub const SQLSTATE_PROTOCOL_VIOLATION: &str = "08P01";
pub const SQLSTATE_CONNECTION_FAILURE: &str = "08006";
pub const SQLSTATE_INVALID_PASSWORD: &str = "28P01";
pub const SQLSTATE_INVALID_SQL_STATEMENT_NAME: &str = "26000";
pub const SQLSTATE_INVALID_CURSOR_NAME: &str = "34000";
pub const SQLSTATE_INVALID_PARAMETER_VALUE: &str = "22023";
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";
pub const SQLSTATE_ADMIN_SHUTDOWN: &str = "57P01";
pub const SQLSTATE_INTERNAL_ERROR: &str = "XX000";

// Transaction status carried by ReadyForQuery. The library does not manage
// transactions, a session is always reported idle.
pub const TRANSACTION_STATUS_IDLE: u8 = b'I';
