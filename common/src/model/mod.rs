mod request;
mod result;

pub use request::{ExternalRequest, InternalRequest};
pub use result::AnalysisResult;
