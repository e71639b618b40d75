pub(crate) use std::task::{Context, Poll};
