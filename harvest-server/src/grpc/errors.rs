//! gRPC error mapping.
//!
//! Every error `Status` carries an `ErrorInfo` detail with the failure
//! reason and the service domain.

use std::collections::HashMap;

use tonic::{Code, Status};
use tonic_types::{ErrorDetails, StatusExt};

pub const DOMAIN: &str = "nbvehbq.ru";

pub fn internal(reason: impl Into<String>) -> Status {
    with_error_info(Code::Internal, "internal error", reason.into())
}

pub fn argument(reason: impl Into<String>) -> Status {
    with_error_info(Code::InvalidArgument, "bad request", reason.into())
}

fn with_error_info(code: Code, message: &str, reason: String) -> Status {
    let mut details = ErrorDetails::new();
    details.set_error_info(reason, DOMAIN, HashMap::new());
    Status::with_error_details(code, message, details)
}
