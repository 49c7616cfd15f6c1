mod encoding;
mod id;
mod text;
mod time;

pub use encoding::{
    CharsetError, charset_from_content_type, decode_text, percent_decode_component,
    percent_encode_component,
};
pub use id::generate_session_id;
pub use text::{pretty_print, with_marker};
pub use time::{current_timestamp_millis, format_timestamp_millis};
