pub mod request_id;

pub use request_id::{request_id_middleware, RequestId, RequestSpanMaker, REQUEST_ID_HEADER};
