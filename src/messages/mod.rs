// Frame-level protocol plumbing: reading typed messages off the socket and
// building the backend messages the server writes in response.

// Declare submodules
pub mod error;
pub mod extended;
pub mod protocol;
pub mod socket;
pub mod types;

// Re-export public items
pub use error::ErrorInfo;
pub use extended::{Bind, BindParameter, Close, CloseTarget, Describe, DescribeTarget, Execute, Parse};
pub use protocol::{
    auth_ok, backend_key_data, bind_complete, close_complete, command_complete, copy_data,
    copy_done, copy_fail, copy_in_response, copy_out_response, data_row, empty_query_response,
    error_response, md5_challenge, md5_hash_password, md5_hash_second_pass, no_data,
    parameter_description, parameter_status, parse_complete, parse_startup,
    plain_password_challenge, portal_suspended, read_password, ready_for_query, row_description,
};
pub use socket::{
    read_message, read_message_body, read_message_code, read_startup_frame, write_all,
    write_all_flush,
};
pub use types::BytesMutReader;

// Frames larger than this are rejected as a protocol violation regardless of
// the configured buffer size.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;
