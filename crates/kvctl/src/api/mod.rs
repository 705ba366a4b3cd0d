//! Operator-facing API

mod http;

pub use http::{HttpApi, HEADER_DONT_DETECT_HOST};
