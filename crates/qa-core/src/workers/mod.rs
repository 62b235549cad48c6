mod endpoint;

pub use endpoint::{Endpoint, EndpointEvent, READ_TIMEOUT, WRITE_TIMEOUT};
