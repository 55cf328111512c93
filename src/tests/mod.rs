pub(crate) mod support;

mod cluster;
