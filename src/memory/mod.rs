pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod free_list;
pub(crate) mod large;
pub(crate) mod reservation;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod tiered;
pub(crate) mod vm;
